//! Wire-format XML documents, deserialized with `quick-xml`'s serde
//! integration rather than hand-rolled tag scanning.

use serde::{Deserialize, Serialize};

/// A paginated bucket listing (`GET ?prefix=...&delimiter=/&marker=...`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListBucketResult {
    #[serde(default)]
    pub is_truncated: bool,
    pub next_marker: Option<String>,
    #[serde(default, rename = "Contents")]
    pub contents: Vec<Contents>,
    #[serde(default, rename = "CommonPrefixes")]
    pub common_prefixes: Vec<CommonPrefixes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Contents {
    pub key: String,
    pub etag: Option<String>,
    pub size: u64,
    pub last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonPrefixes {
    pub prefix: String,
}

/// Service error body, returned on non-2xx responses with a `Content-Type`
/// of `application/xml`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorDocument {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Request body for `POST ?uploadId=UID` — the ordered list of parts being
/// composed into the final object.
#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUpload {
    #[serde(rename = "Part")]
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Serialize)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Response body for the complete-multipart-upload call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompleteMultipartUploadResult {
    pub location: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Response body for `POST ?uploads` — carries the session id every
/// subsequent part/complete/abort call references.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitiateMultipartUploadResult {
    pub upload_id: String,
}

pub fn parse_listing(body: &[u8]) -> Result<ListBucketResult, quick_xml::DeError> {
    quick_xml::de::from_reader(body)
}

pub fn parse_error(body: &[u8]) -> Result<ErrorDocument, quick_xml::DeError> {
    quick_xml::de::from_reader(body)
}

pub fn parse_initiate_multipart(body: &[u8]) -> Result<InitiateMultipartUploadResult, quick_xml::DeError> {
    quick_xml::de::from_reader(body)
}

pub fn parse_complete_multipart(
    body: &[u8],
) -> Result<CompleteMultipartUploadResult, quick_xml::DeError> {
    quick_xml::de::from_reader(body)
}

pub fn serialize_complete_multipart(doc: &CompleteMultipartUpload) -> Result<String, String> {
    quick_xml::se::to_string(doc).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_with_common_prefixes_and_contents() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
    <IsTruncated>true</IsTruncated>
    <NextMarker>d/z</NextMarker>
    <Contents><Key>d/a.txt</Key><ETag>"abc"</ETag><Size>11</Size></Contents>
    <CommonPrefixes><Prefix>d/sub/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let parsed = parse_listing(xml).unwrap();
        assert!(parsed.is_truncated);
        assert_eq!(parsed.next_marker.as_deref(), Some("d/z"));
        assert_eq!(parsed.contents.len(), 1);
        assert_eq!(parsed.contents[0].key, "d/a.txt");
        assert_eq!(parsed.common_prefixes[0].prefix, "d/sub/");
    }

    #[test]
    fn parses_listing_defaults_when_not_truncated() {
        let xml = br#"<ListBucketResult></ListBucketResult>"#;
        let parsed = parse_listing(xml).unwrap();
        assert!(!parsed.is_truncated);
        assert!(parsed.contents.is_empty());
        assert!(parsed.common_prefixes.is_empty());
    }

    #[test]
    fn serializes_complete_multipart_parts_in_order() {
        let doc = CompleteMultipartUpload {
            parts: vec![
                CompletedPart {
                    part_number: 1,
                    etag: "\"e1\"".to_string(),
                },
                CompletedPart {
                    part_number: 2,
                    etag: "\"e2\"".to_string(),
                },
            ],
        };
        let xml = serialize_complete_multipart(&doc).unwrap();
        assert!(xml.find("e1").unwrap() < xml.find("e2").unwrap());
    }
}
