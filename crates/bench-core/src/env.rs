use std::collections::BTreeMap;

/// Read/write access to a key-value environment.
///
/// Empty values are treated the same as unset ones by every lookup helper in
/// this module.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);

    fn non_empty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&mut self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }
}

#[derive(Debug, Default, Clone)]
pub struct MapEnv {
    vars: BTreeMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl EnvSource for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }
}

impl<E: EnvSource + ?Sized> EnvSource for &mut E {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) {
        (**self).set(key, value)
    }
}

pub fn first_non_empty<E: EnvSource + ?Sized>(env: &E, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| env.non_empty(k))
}

pub fn string_or<E: EnvSource + ?Sized>(env: &E, keys: &[&str], default: &str) -> String {
    first_non_empty(env, keys).unwrap_or_else(|| default.to_string())
}

/// First key whose value is set and parses as an integer. Keys holding
/// malformed values are skipped, not fatal.
pub fn first_int<E: EnvSource + ?Sized>(env: &E, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|k| env.non_empty(k))
        .find_map(|v| v.trim().parse::<i64>().ok())
}

pub fn int_or<E: EnvSource + ?Sized>(env: &E, keys: &[&str], default: i64) -> i64 {
    first_int(env, keys).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_non_empty_skips_unset_and_empty_keys() {
        let env = MapEnv::new().with("A", "").with("C", "third");
        assert_eq!(first_non_empty(&env, &["A", "B", "C"]), Some("third".to_string()));
        assert_eq!(first_non_empty(&env, &["A", "B"]), None);
        assert_eq!(string_or(&env, &["A"], "fallback"), "fallback");
    }

    #[test]
    fn first_int_skips_malformed_values() {
        let env = MapEnv::new().with("BENCH_NODES", "two").with("SLURM_NNODES", "4");
        assert_eq!(first_int(&env, &["BENCH_NODES", "SLURM_NNODES"]), Some(4));
        assert_eq!(int_or(&env, &["BENCH_NODES"], 0), 0);
        assert_eq!(int_or(&env, &["MISSING"], -1), -1);
    }

    #[test]
    fn map_env_set_is_visible_to_later_lookups() {
        let mut env: MapEnv = [("RANK", "0")].into_iter().collect();
        env.set("MASTER_PORT", "29500");
        assert_eq!(env.non_empty("MASTER_PORT"), Some("29500".to_string()));
        assert_eq!(env.non_empty("RANK"), Some("0".to_string()));
    }
}
