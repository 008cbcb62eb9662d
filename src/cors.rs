//! Bucket CORS guidance
//!
//! Browser clients talk to the bucket directly, so the bucket needs a CORS
//! rule set before any listing succeeds. This is the rule set offered to the
//! user when a listing fails without an HTTP response.

use serde::{Deserialize, Serialize};

/// One CORS rule in the JSON shape the S3 console accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CorsRule {
    pub allowed_headers: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age_seconds: u32,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Rules that let a browser list, upload (multipart needs the ETag header) and delete
pub fn recommended_rules() -> Vec<CorsRule> {
    vec![CorsRule {
        allowed_headers: strings(&["*"]),
        allowed_methods: strings(&["GET", "PUT", "POST", "DELETE", "HEAD"]),
        allowed_origins: strings(&["*"]),
        expose_headers: strings(&["ETag"]),
        max_age_seconds: 3000,
    }]
}

/// Pretty-printed JSON ready to paste into the bucket's CORS editor
pub fn recommended_json() -> String {
    serde_json::to_string_pretty(&recommended_rules()).unwrap_or_else(|_| "[]".to_string())
}

/// Step-by-step instructions shown with the "needs CORS setup" state
pub fn setup_instructions(bucket: &str) -> String {
    format!(
        "The bucket '{}' could not be reached. This usually means it has no CORS configuration.\n\
         1. Open the bucket in the S3 console and go to Permissions.\n\
         2. Edit \"Cross-origin resource sharing (CORS)\".\n\
         3. Paste the following configuration and save:\n\n{}\n",
        bucket,
        recommended_json()
    )
}
