//! Response validation: turn an HTTP response into TIFF bytes or a
//! classified failure.

use crate::error::AcquisitionError;

use super::transport::HttpResponse;

const TIFF_MAGIC_LE: &[u8] = b"II*\0";
const TIFF_MAGIC_BE: &[u8] = b"MM\0*";

pub fn is_tiff(bytes: &[u8]) -> bool {
    bytes.starts_with(TIFF_MAGIC_LE) || bytes.starts_with(TIFF_MAGIC_BE)
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_tiff_magic(bytes: &[u8]) -> Option<usize> {
    match (find_bytes(bytes, TIFF_MAGIC_LE), find_bytes(bytes, TIFF_MAGIC_BE)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn split_bytes<'a>(data: &'a [u8], separator: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut rest = data;
    while let Some(i) = find_bytes(rest, separator) {
        parts.push(&rest[..i]);
        rest = &rest[i + separator.len()..];
    }
    parts.push(rest);
    parts
}

/// The `boundary` parameter of a multipart Content-Type, unquoted.
fn multipart_boundary(content_type: &str) -> Option<&str> {
    let lower = content_type.to_ascii_lowercase();
    let start = lower.find("boundary=")? + "boundary=".len();
    let value = content_type[start..].split(';').next()?.trim().trim_matches('"');
    (!value.is_empty()).then_some(value)
}

/// Pull the TIFF payload out of a multipart MIME body.
///
/// Parts declared as `image/tiff` or `application/tiff` are preferred;
/// otherwise the first TIFF signature found in any part is used.
pub fn extract_tiff_from_multipart(body: &[u8], content_type: &str) -> Option<Vec<u8>> {
    let Some(boundary) = multipart_boundary(content_type) else {
        return find_tiff_magic(body).map(|i| body[i..].to_vec());
    };
    let delimiter = format!("--{boundary}");
    let parts = split_bytes(body, delimiter.as_bytes());

    for part in &parts {
        let (headers, payload) = match find_bytes(part, b"\r\n\r\n") {
            Some(i) => (&part[..i], &part[i + 4..]),
            None => match find_bytes(part, b"\n\n") {
                Some(i) => (&part[..i], &part[i + 2..]),
                None => continue,
            },
        };
        let headers = String::from_utf8_lossy(headers).to_ascii_lowercase();
        if !(headers.contains("image/tiff") || headers.contains("application/tiff")) {
            continue;
        }
        let payload = payload.strip_suffix(b"\r\n").unwrap_or(payload);
        if is_tiff(payload) {
            return Some(payload.to_vec());
        }
    }

    parts.iter().find_map(|part| {
        find_tiff_magic(part).map(|i| {
            let payload = &part[i..];
            payload.strip_suffix(b"\r\n").unwrap_or(payload).to_vec()
        })
    })
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Text of every element whose local name contains "Exception", in
/// document order, joined by " | ". `None` when there is none.
pub fn parse_service_exception(body: &str) -> Option<String> {
    let mut messages: Vec<String> = Vec::new();
    let mut rest = body;

    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find('>') else { break };
        let tag = &rest[..close];
        rest = &rest[close + 1..];

        if tag.starts_with('/') || tag.starts_with('?') || tag.starts_with('!') || tag.ends_with('/') {
            continue;
        }
        let name = tag.split_whitespace().next().unwrap_or_default();
        let local = name.rsplit(':').next().unwrap_or(name);
        if !local.contains("Exception") {
            continue;
        }

        let text_end = rest.find('<').unwrap_or(rest.len());
        let text = decode_entities(rest[..text_end].trim());
        if !text.is_empty() && !messages.contains(&text) {
            messages.push(text);
        }
    }

    (!messages.is_empty()).then(|| messages.join(" | "))
}

fn describe_body(response: &HttpResponse) -> String {
    let text = String::from_utf8_lossy(&response.body);
    parse_service_exception(&text).unwrap_or_else(|| response.body_preview())
}

/// Check a response and return the TIFF bytes it carries.
///
/// Non-success statuses become `Transport` errors carrying the status, so
/// the caller can decide whether to retry. Everything else that is not a
/// TIFF is a `Validation` error.
pub fn validate_response(response: HttpResponse) -> Result<Vec<u8>, AcquisitionError> {
    if !response.is_success() {
        return Err(AcquisitionError::Transport {
            status: Some(response.status),
            message: describe_body(&response),
        });
    }
    if response.body.is_empty() {
        return Err(AcquisitionError::Validation("empty response body".into()));
    }

    let content_type = response.content_type.to_ascii_lowercase();

    if content_type.contains("multipart") {
        return extract_tiff_from_multipart(&response.body, &response.content_type).ok_or_else(|| {
            AcquisitionError::Validation("multipart response contains no TIFF part".into())
        });
    }

    if content_type.contains("xml") || content_type.starts_with("text/") || response.body.starts_with(b"<") {
        return Err(AcquisitionError::Validation(format!(
            "service error: {}",
            describe_body(&response)
        )));
    }

    if !is_tiff(&response.body) {
        return Err(AcquisitionError::Validation(format!(
            "response is not a TIFF (content-type '{}', {} bytes)",
            response.content_type,
            response.body.len()
        )));
    }

    Ok(response.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(content_type: &str, body: &[u8]) -> HttpResponse {
        HttpResponse {
            status: 200,
            content_type: content_type.to_string(),
            body: body.to_vec(),
        }
    }

    const EXCEPTION_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ows:ExceptionReport xmlns:ows="http://www.opengis.net/ows/2.0" version="2.0.1">
  <ows:Exception exceptionCode="InvalidParameterValue" locator="SUBSET">
    <ows:ExceptionText>Subset X(1,2) is out of bounds &amp; ignored</ows:ExceptionText>
  </ows:Exception>
</ows:ExceptionReport>"#;

    #[test]
    fn test_tiff_magic() {
        assert!(is_tiff(b"II*\0rest"));
        assert!(is_tiff(b"MM\0*rest"));
        assert!(!is_tiff(b"<?xml"));
        assert!(!is_tiff(b"II"));
    }

    #[test]
    fn test_parse_exception_text() {
        assert_eq!(
            parse_service_exception(EXCEPTION_XML).as_deref(),
            Some("Subset X(1,2) is out of bounds & ignored")
        );
        let two = "<ServiceExceptionReport><ServiceException>first</ServiceException>\
                   <ServiceException>second</ServiceException></ServiceExceptionReport>";
        assert_eq!(parse_service_exception(two).as_deref(), Some("first | second"));
        assert_eq!(parse_service_exception("<html><body>oops</body></html>"), None);
    }

    #[test]
    fn test_xml_body_rejected_even_with_tiff_content_type() {
        let err = validate_response(ok("image/tiff", EXCEPTION_XML.as_bytes())).unwrap_err();
        match err {
            AcquisitionError::Validation(msg) => assert!(msg.contains("out of bounds")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_text_content_type_rejected() {
        let err = validate_response(ok("text/plain", b"II*\0 not really")).unwrap_err();
        assert!(matches!(err, AcquisitionError::Validation(_)));
    }

    #[test]
    fn test_http_error_keeps_status() {
        let resp = HttpResponse {
            status: 503,
            content_type: "text/html".into(),
            body: b"busy".to_vec(),
        };
        match validate_response(resp).unwrap_err() {
            AcquisitionError::Transport { status, message } => {
                assert_eq!(status, Some(503));
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_tiff_binary_rejected() {
        let err = validate_response(ok("application/octet-stream", b"\x89PNG....")).unwrap_err();
        assert!(matches!(err, AcquisitionError::Validation(_)));
        assert!(validate_response(ok("image/tiff", b"")).is_err());
    }

    #[test]
    fn test_plain_tiff_passes() {
        let body = b"II*\0payload".to_vec();
        assert_eq!(validate_response(ok("image/tiff", &body)).unwrap(), body);
    }

    #[test]
    fn test_multipart_extraction() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--wcsBoundary\r\nContent-Type: text/xml\r\n\r\n<Coverages/>\r\n");
        body.extend_from_slice(b"--wcsBoundary\r\nContent-Type: image/tiff\r\n\r\n");
        body.extend_from_slice(b"II*\0tiffdata");
        body.extend_from_slice(b"\r\n--wcsBoundary--\r\n");

        let ct = "multipart/related; boundary=\"wcsBoundary\"; type=text/xml";
        let tiff = validate_response(ok(ct, &body)).unwrap();
        assert_eq!(tiff, b"II*\0tiffdata");
    }

    #[test]
    fn test_multipart_falls_back_to_magic_search() {
        let body = b"--B\r\nContent-Type: application/octet-stream\r\n\r\nMM\0*data\r\n--B--".to_vec();
        let tiff = extract_tiff_from_multipart(&body, "multipart/mixed; boundary=B").unwrap();
        assert_eq!(tiff, b"MM\0*data");

        let none = b"--B\r\nContent-Type: text/xml\r\n\r\n<x/>\r\n--B--".to_vec();
        assert!(extract_tiff_from_multipart(&none, "multipart/mixed; boundary=B").is_none());
    }
}
