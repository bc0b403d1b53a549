use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Deserializer};

use crate::{AccelError, AccelResult};

/// Decoded `content_b64` payload. Arrives base64-encoded on a single
/// protocol line, so it is only suitable for small files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content(pub Vec<u8>);

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Content(bytes))
    }
}

/// One request line. `dest` is required; the first present selector
/// (in field order below) picks the operation. Unknown fields are
/// ignored, so a misspelled selector falls through to no operation.
#[derive(Debug, Deserialize)]
pub struct FsRequest {
    pub dest: String,
    pub src: Option<String>,
    pub content_b64: Option<Content>,
    pub perm: Option<u32>,
    #[serde(default)]
    pub speculate: bool,
    #[serde(default)]
    pub existence: bool,
    #[serde(default)]
    pub mkdir: bool,
    #[serde(default)]
    pub listdir: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub delete_recursive: bool,
}

/// Response value for one request, encoded as a single JSON line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    True,
    False,
    Invalid,
    Names(Vec<String>),
}

impl Response {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Response::True
        } else {
            Response::False
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Response::True => "true".to_string(),
            Response::False => "false".to_string(),
            Response::Invalid => "null".to_string(),
            Response::Names(names) => {
                serde_json::to_string(names).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }
}

/// Lexically normalize an absolute path: collapse repeated slashes and
/// resolve `.`/`..` segments. Symbolic links are assumed absent, so the
/// result names the same object the kernel would resolve.
pub fn normalize_path(path: &str) -> AccelResult<String> {
    if !path.starts_with('/') {
        return Err(AccelError::InvalidParam(format!(
            "path must be absolute: {}",
            path
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_cleans_segments() {
        assert_eq!(normalize_path("/work/test").unwrap(), "/work/test");
        assert_eq!(normalize_path("/work//test/").unwrap(), "/work/test");
        assert_eq!(normalize_path("/work/./test").unwrap(), "/work/test");
        assert_eq!(normalize_path("/work/a/../test").unwrap(), "/work/test");
        assert_eq!(normalize_path("/../..").unwrap(), "/");
        assert_eq!(normalize_path("/").unwrap(), "/");
    }

    #[test]
    fn test_normalize_path_rejects_relative() {
        assert!(normalize_path("work/test").is_err());
        assert!(normalize_path("").is_err());
    }

    #[test]
    fn test_decode_content_b64() {
        let req: FsRequest =
            serde_json::from_str(r#"{"dest": "/f", "content_b64": "dGVzdC1zdHJpbmc="}"#).unwrap();
        assert_eq!(req.content_b64.unwrap().0, b"test-string");
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let parsed =
            serde_json::from_str::<FsRequest>(r#"{"dest": "/f", "content_b64": "%%%"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_decode_requires_dest() {
        assert!(serde_json::from_str::<FsRequest>(r#"{"speculate": true}"#).is_err());
    }

    #[test]
    fn test_misspelled_selector_sets_no_operation() {
        // `speculative` is not a selector; the request must fall through
        // to the no-operation branch rather than pick anything.
        let req: FsRequest =
            serde_json::from_str(r#"{"dest": "/f", "speculative": true}"#).unwrap();
        assert!(!req.speculate);
        assert!(req.src.is_none());
        assert!(req.content_b64.is_none());
        assert!(!req.existence && !req.mkdir && !req.listdir);
        assert!(!req.delete && !req.delete_recursive);
    }

    #[test]
    fn test_encode_responses() {
        assert_eq!(Response::True.encode(), "true");
        assert_eq!(Response::False.encode(), "false");
        assert_eq!(Response::Invalid.encode(), "null");
        assert_eq!(
            Response::Names(vec!["a".to_string(), "b".to_string()]).encode(),
            r#"["a","b"]"#
        );
        assert_eq!(Response::Names(Vec::new()).encode(), "[]");
    }
}
