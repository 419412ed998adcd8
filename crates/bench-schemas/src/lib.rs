use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

static SCHEMAS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub const RESULT_SCHEMA: &str = "bench_result_v1.jsonschema";

pub fn schema_names() -> Vec<String> {
    let mut names: Vec<String> = SCHEMAS
        .files()
        .filter_map(|f| f.path().file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

pub fn load_schema(name: &str) -> Result<Value> {
    let file = SCHEMAS
        .get_file(name)
        .ok_or_else(|| anyhow!("unknown schema: {}", name))?;
    let text = file
        .contents_utf8()
        .ok_or_else(|| anyhow!("schema is not utf-8: {}", name))?;
    Ok(serde_json::from_str(text)?)
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|e| anyhow!("schema {} failed to compile: {}", name, e))
}

pub fn validate_value(name: &str, value: &Value) -> Result<Vec<String>> {
    let compiled = compile_schema(name)?;
    let errors = match compiled.validate(value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect(),
    };
    Ok(errors)
}
