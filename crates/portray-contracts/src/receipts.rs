use std::path::Path;

use serde_json::{Map, Value};

use crate::requests::{FineTuneRequest, GenerationRequest};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Receipt written beside a generated portrait: the submitted parameters,
/// the provider job, and any normalization warnings.
pub fn build_generation_receipt(
    request: &GenerationRequest,
    job_id: &str,
    sample_url: &str,
    warnings: &[String],
    image_path: &Path,
    receipt_path: &Path,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&Value::Object(request.payload())),
    );

    let mut job = Map::new();
    job.insert("id".to_string(), Value::String(job_id.to_string()));
    job.insert("sample".to_string(), Value::String(sample_url.to_string()));
    root.insert("job".to_string(), Value::Object(job));

    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );

    let mut artifacts = Map::new();
    artifacts.insert(
        "image_path".to_string(),
        Value::String(image_path.to_string_lossy().to_string()),
    );
    artifacts.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    root.insert("artifacts".to_string(), Value::Object(artifacts));

    Value::Object(root)
}

/// Receipt for a fine-tune upload: the submitted hyperparameters (archive
/// bytes omitted) and the provider's raw response.
pub fn build_finetune_receipt(
    request: &FineTuneRequest,
    archive_path: &Path,
    status: u16,
    body: &Value,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "archive_path".to_string(),
        Value::String(archive_path.to_string_lossy().to_string()),
    );

    let mut response = Map::new();
    response.insert("status".to_string(), Value::Number(status.into()));
    response.insert("body".to_string(), sanitize_payload(body));
    root.insert("response".to_string(), Value::Object(response));

    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Receipts stay reviewable: base64 blobs are replaced with a marker.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(lowered.as_str(), "file_data" | "b64_json" | "image_bytes") {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::requests::{FineTuneRequest, GenerationRequest};

    use super::{
        build_finetune_receipt, build_generation_receipt, write_receipt, RECEIPT_SCHEMA_VERSION,
    };

    #[test]
    fn generation_receipt_has_expected_shape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image_path = temp.path().join("portrait-1.jpg");
        let receipt_path = temp.path().join("receipt-1.json");

        let mut request = GenerationRequest::with_defaults("subject_tok, headshot", "ft-1");
        request.aspect_ratio = "16:9".to_string();
        let warnings = vec!["note".to_string()];

        let payload = build_generation_receipt(
            &request,
            "job-42",
            "https://delivery.example/sample.jpg",
            &warnings,
            &image_path,
            &receipt_path,
        );
        write_receipt(&receipt_path, &payload)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&receipt_path)?)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["request"]["aspect_ratio"], json!("16:9"));
        assert_eq!(parsed["job"]["id"], json!("job-42"));
        assert_eq!(
            parsed["job"]["sample"],
            json!("https://delivery.example/sample.jpg")
        );
        assert_eq!(parsed["warnings"][0], json!("note"));
        assert_eq!(
            parsed["artifacts"]["image_path"],
            json!(image_path.to_string_lossy())
        );
        Ok(())
    }

    #[test]
    fn finetune_receipt_omits_archive_blob() {
        let request = FineTuneRequest::with_defaults("test run", "subject_tok");
        let body = json!({"id": "ft-job-1", "file_data": "aGVsbG8="});
        let receipt = build_finetune_receipt(
            &request,
            std::path::Path::new("subject.zip"),
            200,
            &body,
        );
        assert_eq!(receipt["response"]["status"], json!(200));
        assert_eq!(receipt["response"]["body"]["id"], json!("ft-job-1"));
        assert_eq!(receipt["response"]["body"]["file_data"], json!("<omitted>"));
        assert_eq!(receipt["request"]["trigger_word"], json!("subject_tok"));
    }
}
