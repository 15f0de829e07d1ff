use std::sync::LazyLock;

use anyhow::bail;
use base64::Engine;
use hyper::header::{HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::HeaderMap;
use regex::{Captures, Regex};
use tracing::{trace, warn};

use crate::error::DocError;

/// Where a document's bytes come from. This is decided by whoever creates the byte source and
///  never guessed from a URL scheme.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OriginKind {
    /// bytes on the local filesystem - ranges are native, there is nothing to negotiate
    LocalFile,
    /// an http(s) origin, range support is negotiated from the response headers
    Http,
    /// any other network origin served through a generic client (e.g. a `file:` or `data:`
    ///  URL). These never get range requests.
    OtherNetwork,
}

impl OriginKind {
    pub fn is_http(self) -> bool {
        self == OriginKind::Http
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RangeCapabilities {
    pub allow_range_requests: bool,
    /// the content length announced by the origin, if it is a well-formed integer
    pub suggested_length: Option<u64>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim())
}

/// Decides whether range requests are worth it for a response. Any failed check means
///  progressive loading only - this is policy, not an error. The only `Err` is an invalid
///  chunk size.
pub fn validate_range_request_capabilities(origin: OriginKind, headers: &HeaderMap, range_chunk_size: u64, disable_range: bool) -> anyhow::Result<RangeCapabilities> {
    if range_chunk_size == 0 {
        bail!("range_chunk_size must be an integer larger than zero");
    }

    let suggested_length = header_str(headers, &CONTENT_LENGTH)
        .and_then(|s| s.parse::<u64>().ok());
    let mut result = RangeCapabilities {
        allow_range_requests: false,
        suggested_length,
    };

    if origin == OriginKind::LocalFile {
        result.allow_range_requests = !disable_range;
        return Ok(result);
    }

    let Some(length) = suggested_length else {
        return Ok(result);
    };
    if length <= range_chunk_size.saturating_mul(2) {
        // a single full fetch is cheaper
        return Ok(result);
    }
    if disable_range || !origin.is_http() {
        return Ok(result);
    }
    if header_str(headers, &ACCEPT_RANGES) != Some("bytes") {
        return Ok(result);
    }
    match header_str(headers, &CONTENT_ENCODING) {
        None | Some("") | Some("identity") => {}
        Some(encoding) => {
            trace!(encoding, "content encoding makes byte offsets meaningless - no range requests");
            return Ok(result);
        }
    }

    result.allow_range_requests = true;
    Ok(result)
}

pub fn validate_response_status(origin: OriginKind, status: u16) -> bool {
    status == 200 || status == 206 || (!origin.is_http() && status == 0)
}

pub fn create_response_status_error(status: u16, url: &str) -> DocError {
    let message = format!("Unexpected server response ({}) while retrieving PDF \"{}\".", status, url);
    if status == 404 || (status == 0 && url.starts_with("file:")) {
        DocError::MissingResource { message }
    }
    else {
        DocError::UnexpectedResponse { message, status }
    }
}

/// Request headers for `origin`: the configured headers for http origins, nothing for the others.
///  Headers that are not valid HTTP are skipped with a warning.
pub fn create_headers(origin: OriginKind, http_headers: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !origin.is_http() {
        return headers;
    }
    for (name, value) in http_headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(name, "skipping invalid request header"),
        }
    }
    headers
}

pub fn is_pdf_file(filename: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(".pdf")
}

/// The file name suggested by the `Content-Disposition` header, if it names a PDF file.
pub fn extract_filename_from_header(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?;
    // NB: header bytes are treated as ISO-8859-1 here - the charset fixup happens later
    let raw: String = value.as_bytes().iter().map(|&b| b as char).collect();

    let mut filename = get_filename_from_content_disposition(&raw);
    if filename.contains('%') {
        if let Some(decoded) = percent_decode_utf8(&filename) {
            filename = decoded;
        }
    }

    is_pdf_file(&filename).then_some(filename)
}

/// `None` for malformed escapes or if the result is not UTF-8
fn percent_decode_utf8(s: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next()?.to_digit(16)?;
            let lo = chars.next()?.to_digit(16)?;
            bytes.push((hi * 16 + lo) as u8);
        }
        else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    String::from_utf8(bytes).ok()
}

fn param_regex(attribute_pattern: &str) -> Regex {
    let pattern = format!(r#"(?i)(?:^|;)\s*{}\s*=\s*([^";\s][^;\s]*|"(?:[^"\\]|\\"?)+"?)"#, attribute_pattern);
    Regex::new(&pattern).expect("content disposition patterns are valid")
}

static FILENAME_EXT: LazyLock<Regex> = LazyLock::new(|| param_regex(r"filename\*"));
static FILENAME_CONTINUATION: LazyLock<Regex> = LazyLock::new(|| param_regex(r"filename\*(\d+)(\*?)"));
static FILENAME: LazyLock<Regex> = LazyLock::new(|| param_regex("filename"));
static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([\w-]*)\?([QqBb])\?([^?]*)\?=").expect("encoded word pattern is valid")
});
static QUOTED_PRINTABLE_BYTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=([0-9a-fA-F]{2})").expect("quoted printable pattern is valid")
});

/// Extracts the file name from a Content-Disposition value, or an empty string. `filename*`
///  (RFC 6266 / 5987) takes precedence over RFC 2231 continuations, which take precedence over
///  a plain `filename`.
///
/// The input is a 'binary string' with one char per header byte.
pub fn get_filename_from_content_disposition(content_disposition: &str) -> String {
    DispositionDecoder { needs_encoding_fixup: true }.decode(content_disposition)
}

struct DispositionDecoder {
    needs_encoding_fixup: bool,
}

impl DispositionDecoder {
    fn decode(&mut self, content_disposition: &str) -> String {
        if let Some(caps) = FILENAME_EXT.captures(content_disposition) {
            let filename = rfc2616_unquote(&caps[1]);
            let filename = unescape(&filename);
            let filename = self.rfc5987_decode(&filename);
            let filename = self.rfc2047_decode(&filename);
            return self.fixup_encoding(filename);
        }

        let continued = self.rfc2231_get_param(content_disposition);
        if !continued.is_empty() {
            let filename = self.rfc2047_decode(&continued);
            return self.fixup_encoding(filename);
        }

        if let Some(caps) = FILENAME.captures(content_disposition) {
            let filename = rfc2616_unquote(&caps[1]);
            let filename = self.rfc2047_decode(&filename);
            return self.fixup_encoding(filename);
        }
        String::new()
    }

    fn text_decode(&mut self, encoding: &str, value: &str) -> String {
        if encoding.is_empty() || !value.chars().all(|c| (c as u32) <= 0xff) {
            return value.to_string();
        }

        match encoding.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => {
                let bytes: Vec<u8> = value.chars().map(|c| c as u32 as u8).collect();
                match String::from_utf8(bytes) {
                    Ok(decoded) => {
                        self.needs_encoding_fixup = false;
                        decoded
                    }
                    Err(_) => value.to_string(),
                }
            }
            "iso-8859-1" | "iso8859-1" | "latin1" | "l1" => {
                // one char per byte already is ISO-8859-1
                self.needs_encoding_fixup = false;
                value.to_string()
            }
            other => {
                trace!(encoding = other, "unsupported charset in content disposition");
                value.to_string()
            }
        }
    }

    fn fixup_encoding(&mut self, value: String) -> String {
        if self.needs_encoding_fixup && value.chars().any(|c| (0x80..=0xff).contains(&(c as u32))) {
            let value = self.text_decode("utf-8", &value);
            if self.needs_encoding_fixup {
                return self.text_decode("iso-8859-1", &value);
            }
            return value;
        }
        value
    }

    fn rfc2231_get_param(&mut self, content_disposition: &str) -> String {
        let mut matches: Vec<Option<(bool, String)>> = Vec::new();
        for caps in FILENAME_CONTINUATION.captures_iter(content_disposition) {
            let n = &caps[1];
            if n.len() > 1 && n.starts_with('0') {
                continue;
            }
            let Ok(n) = n.parse::<usize>() else {
                continue;
            };
            if matches.get(n).map(|m| m.is_some()).unwrap_or(false) {
                if n == 0 {
                    break;
                }
                continue;
            }
            if matches.len() <= n {
                matches.resize(n + 1, None);
            }
            matches[n] = Some((!caps[2].is_empty(), caps[3].to_string()));
        }

        let mut result = String::new();
        for (n, m) in matches.into_iter().enumerate() {
            let Some((quoted, part)) = m else {
                break;
            };
            let mut part = rfc2616_unquote(&part);
            if quoted {
                part = unescape(&part);
                if n == 0 {
                    part = self.rfc5987_decode(&part);
                }
            }
            result.push_str(&part);
        }
        result
    }

    /// `charset'language'value`
    fn rfc5987_decode(&mut self, ext_value: &str) -> String {
        let Some(encoding_end) = ext_value.find('\'') else {
            return ext_value.to_string();
        };
        let encoding = &ext_value[..encoding_end];
        let lang_value = &ext_value[encoding_end + 1..];
        let value = match lang_value.find('\'') {
            Some(idx) => &lang_value[idx + 1..],
            None => lang_value,
        };
        self.text_decode(encoding, value)
    }

    /// MIME encoded words (`=?charset?Q?text?=`), which some servers send although RFC 6266
    ///  does not allow them
    fn rfc2047_decode(&mut self, value: &str) -> String {
        if !value.starts_with("=?") || value.chars().any(|c| (c as u32) <= 0x19 || (0x80..=0xff).contains(&(c as u32))) {
            return value.to_string();
        }

        ENCODED_WORD.replace_all(value, |caps: &Captures| {
            let charset = &caps[1];
            let text = &caps[3];
            let text = if caps[2].eq_ignore_ascii_case("q") {
                let text = text.replace('_', " ");
                QUOTED_PRINTABLE_BYTE.replace_all(&text, |hex: &Captures| {
                    u8::from_str_radix(&hex[1], 16)
                        .map(|b| (b as char).to_string())
                        .unwrap_or_default()
                }).into_owned()
            }
            else {
                match base64::engine::general_purpose::STANDARD.decode(text) {
                    Ok(bytes) => bytes.into_iter().map(|b| b as char).collect(),
                    Err(_) => text.to_string(),
                }
            };
            self.text_decode(charset, &text)
        }).into_owned()
    }
}

fn rfc2616_unquote(value: &str) -> String {
    let Some(quoted) = value.strip_prefix('"') else {
        return value.to_string();
    };

    let mut parts: Vec<String> = Vec::new();
    for part in quoted.split("\\\"") {
        match part.find('"') {
            Some(end) => {
                parts.push(strip_backslashes(&part[..end]));
                break;
            }
            None => parts.push(strip_backslashes(part)),
        }
    }
    parts.join("\"")
}

fn strip_backslashes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) => result.push(escaped),
                None => result.push(c),
            }
        }
        else {
            result.push(c);
        }
    }
    result
}

/// `%XX` and `%uXXXX` escapes into chars, leaving malformed escapes as they are
fn unescape(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let hex = |from: usize, len: usize| -> Option<u32> {
        let digits: String = chars.get(from..from + len)?.iter().collect();
        u32::from_str_radix(&digits, 16).ok()
    };

    let mut result = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '%' {
            if chars.get(i + 1) == Some(&'u') {
                if let Some(c) = hex(i + 2, 4).and_then(char::from_u32) {
                    result.push(c);
                    i += 6;
                    continue;
                }
            }
            if let Some(c) = hex(i + 1, 2).and_then(char::from_u32) {
                result.push(c);
                i += 3;
                continue;
            }
        }
        result.push(chars[i]);
        i += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn headers(entries: &[(&'static str, &str)]) -> HeaderMap {
        let mut result = HeaderMap::new();
        for (name, value) in entries {
            result.insert(HeaderName::from_static(name), HeaderValue::from_bytes(value.as_bytes()).unwrap());
        }
        result
    }

    #[rstest]
    #[case::big_enough(OriginKind::Http, &[("accept-ranges", "bytes"), ("content-length", "8192")], false, true, Some(8192))]
    #[case::too_small(OriginKind::Http, &[("accept-ranges", "bytes"), ("content-length", "8")], false, false, Some(8))]
    #[case::disabled(OriginKind::Http, &[("accept-ranges", "bytes"), ("content-length", "8192")], true, false, Some(8192))]
    #[case::not_http(OriginKind::OtherNetwork, &[("accept-ranges", "bytes"), ("content-length", "8192")], false, false, Some(8192))]
    #[case::accept_ranges_none(OriginKind::Http, &[("accept-ranges", "none"), ("content-length", "8192")], false, false, Some(8192))]
    #[case::no_accept_ranges(OriginKind::Http, &[("content-length", "8192")], false, false, Some(8192))]
    #[case::gzip(OriginKind::Http, &[("accept-ranges", "bytes"), ("content-encoding", "gzip"), ("content-length", "8192")], false, false, Some(8192))]
    #[case::identity(OriginKind::Http, &[("accept-ranges", "bytes"), ("content-encoding", "identity"), ("content-length", "8192")], false, true, Some(8192))]
    #[case::length_not_a_number(OriginKind::Http, &[("accept-ranges", "bytes"), ("content-length", "eight")], false, false, None)]
    #[case::no_length(OriginKind::Http, &[("accept-ranges", "bytes")], false, false, None)]
    #[case::local_file(OriginKind::LocalFile, &[("content-length", "8")], false, true, Some(8))]
    #[case::local_file_disabled(OriginKind::LocalFile, &[("content-length", "8192")], true, false, Some(8192))]
    fn test_validate_range_request_capabilities(
        #[case] origin: OriginKind,
        #[case] entries: &[(&'static str, &str)],
        #[case] disable_range: bool,
        #[case] expected_allow: bool,
        #[case] expected_length: Option<u64>,
    ) {
        let result = validate_range_request_capabilities(origin, &headers(entries), 64, disable_range).unwrap();
        assert_eq!(result, RangeCapabilities { allow_range_requests: expected_allow, suggested_length: expected_length });
    }

    #[rstest]
    #[case::large(10_000_000, true)]
    #[case::below_twice_the_chunk_size(100_000, false)]
    #[case::exactly_twice_the_chunk_size(131_072, false)]
    fn test_default_chunk_size_threshold(#[case] length: u64, #[case] expected: bool) {
        let length = length.to_string();
        let h = headers(&[("accept-ranges", "bytes"), ("content-length", length.as_str())]);
        let result = validate_range_request_capabilities(OriginKind::Http, &h, 65_536, false).unwrap();
        assert_eq!(result.allow_range_requests, expected);
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        assert!(validate_range_request_capabilities(OriginKind::Http, &HeaderMap::new(), 0, false).is_err());
    }

    #[rstest]
    #[case::ok(OriginKind::Http, 200, true)]
    #[case::partial(OriginKind::Http, 206, true)]
    #[case::redirect(OriginKind::Http, 302, false)]
    #[case::not_found(OriginKind::Http, 404, false)]
    #[case::zero_http(OriginKind::Http, 0, false)]
    #[case::zero_other(OriginKind::OtherNetwork, 0, true)]
    fn test_validate_response_status(#[case] origin: OriginKind, #[case] status: u16, #[case] expected: bool) {
        assert_eq!(validate_response_status(origin, status), expected);
    }

    #[rstest]
    #[case::not_found("https://foo.com/bar.pdf", 404, true)]
    #[case::local_file("file://foo.pdf", 0, true)]
    #[case::redirect("https://foo.com/bar.pdf", 302, false)]
    #[case::network_error("https://foo.com/bar.pdf", 0, false)]
    fn test_create_response_status_error(#[case] url: &str, #[case] status: u16, #[case] missing: bool) {
        let error = create_response_status_error(status, url);
        assert_eq!(error.message(), format!("Unexpected server response ({}) while retrieving PDF \"{}\".", status, url));
        match error {
            DocError::MissingResource { .. } => assert!(missing),
            DocError::UnexpectedResponse { status: s, .. } => {
                assert!(!missing);
                assert_eq!(s, status);
            }
            other => panic!("unexpected error kind {:?}", other),
        }
    }

    #[test]
    fn test_create_headers() {
        let configured = vec![
            ("Content-Length".to_string(), "100".to_string()),
            ("Accept-Ranges".to_string(), "bytes".to_string()),
            ("in valid".to_string(), "x".to_string()),
        ];

        assert!(create_headers(OriginKind::OtherNetwork, &configured).is_empty());
        assert!(create_headers(OriginKind::LocalFile, &configured).is_empty());

        let headers = create_headers(OriginKind::Http, &configured);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("content-length").unwrap(), "100");
        assert_eq!(headers.get("accept-ranges").unwrap(), "bytes");
    }

    #[rstest]
    #[case::blank("", None)]
    #[case::inline("inline", None)]
    #[case::attachment("attachment", None)]
    #[case::quoted("attachment; filename=\"filename.pdf\"", Some("filename.pdf"))]
    #[case::spaces("attachment; filename=\"filename.pdf and spaces.pdf\"", Some("filename.pdf and spaces.pdf"))]
    #[case::semicolon("attachment; filename=\"tl;dr.pdf\"", Some("tl;dr.pdf"))]
    #[case::token("attachment; filename=filename.pdf", Some("filename.pdf"))]
    #[case::trailing_garbage("attachment; filename=filename.pdf someotherparam", Some("filename.pdf"))]
    #[case::percent_encoded("attachment; filename=\"%e4%b8%ad%e6%96%87.pdf\"", Some("中文.pdf"))]
    #[case::lone_percent("attachment; filename=\"100%.pdf\"", Some("100%.pdf"))]
    #[case::ext_plain("attachment; filename*=filename.pdf", Some("filename.pdf"))]
    #[case::ext_no_charset("attachment; filename*=''filename.pdf", Some("filename.pdf"))]
    #[case::ext_utf8("attachment; filename*=utf-8''filename.pdf", Some("filename.pdf"))]
    #[case::ext_wins_after("attachment; filename=no.pdf; filename*=utf-8''filename.pdf", Some("filename.pdf"))]
    #[case::ext_wins_before("attachment; filename*=utf-8''filename.pdf; filename=no.pdf", Some("filename.pdf"))]
    #[case::ext_latin1("attachment; filename*=iso-8859-1''%e4.pdf", Some("ä.pdf"))]
    #[case::continuation("attachment; filename*0=filename; filename*1=.pdf", Some("filename.pdf"))]
    #[case::continuation_with_gap("attachment; filename*0=file; filename*2=.pdf", None)]
    #[case::raw_utf8("attachment; filename=\"中文.pdf\"", Some("中文.pdf"))]
    #[case::encoded_word_q("attachment; filename==?utf-8?Q?caf=C3=A9.pdf?=", Some("café.pdf"))]
    #[case::encoded_word_b("attachment; filename==?utf-8?B?ZG9jLnBkZg==?=", Some("doc.pdf"))]
    #[case::not_a_pdf("attachment; filename=\"filename.png\"", None)]
    #[case::case_insensitive_extension("form-data; name=\"fieldName\"; filename=\"file.PdF\"", Some("file.PdF"))]
    fn test_extract_filename_from_header(#[case] disposition: &str, #[case] expected: Option<&str>) {
        let h = headers(&[("content-disposition", disposition)]);
        assert_eq!(extract_filename_from_header(&h).as_deref(), expected);
    }

    #[test]
    fn test_no_content_disposition() {
        assert_eq!(extract_filename_from_header(&HeaderMap::new()), None);
    }
}
