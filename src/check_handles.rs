//! Persistent identifier checks for CMDI resource proxies
//!
//! Looks at the `ResourceRef` of every `ResourceProxy` whose `ResourceType` is
//! `Resource` or `Metadata`, checks that it is a handle in one of the accepted forms
//! and, when resolving is enabled, that it resolves.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use reqwest::Url;
use tracing::debug;

use crate::error::{FetchError, InitializationError, Result};
use crate::handle_resolver::{HandleResolver, HandleResolverConfig, ResolverStats};
use crate::report::{Message, Severity, ValidationReport};
use crate::validator::{Document, Extension};

const HDL_SCHEME: &str = "hdl";
const HDL_PROXY_HOST: &str = "hdl.handle.net";
const URN_SCHEME: &str = "urn";

static COMMENT_REGEX: OnceLock<Regex> = OnceLock::new();
static PROXY_REGEX: OnceLock<Regex> = OnceLock::new();
static RESOURCE_TYPE_REGEX: OnceLock<Regex> = OnceLock::new();
static RESOURCE_REF_REGEX: OnceLock<Regex> = OnceLock::new();
static SCHEME_REGEX: OnceLock<Regex> = OnceLock::new();

fn comment_regex() -> &'static Regex {
    COMMENT_REGEX.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("Failed to compile comment regex"))
}

fn proxy_regex() -> &'static Regex {
    PROXY_REGEX.get_or_init(|| {
        Regex::new(r"(?s)<(?:[\w.-]+:)?ResourceProxy\b[^>]*>(.*?)</(?:[\w.-]+:)?ResourceProxy\s*>")
            .expect("Failed to compile ResourceProxy regex")
    })
}

fn resource_type_regex() -> &'static Regex {
    RESOURCE_TYPE_REGEX.get_or_init(|| {
        Regex::new(r"<(?:[\w.-]+:)?ResourceType\b[^>]*>(Resource|Metadata)</(?:[\w.-]+:)?ResourceType\s*>")
            .expect("Failed to compile ResourceType regex")
    })
}

fn resource_ref_regex() -> &'static Regex {
    RESOURCE_REF_REGEX.get_or_init(|| {
        Regex::new(r"(?s)<(?:[\w.-]+:)?ResourceRef\b[^>]*?(?:/>|>(.*?)</(?:[\w.-]+:)?ResourceRef\s*>)")
            .expect("Failed to compile ResourceRef regex")
    })
}

fn scheme_regex() -> &'static Regex {
    SCHEME_REGEX.get_or_init(|| Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]*):").expect("Failed to compile scheme regex"))
}

/// A `ResourceRef` value and where its element starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub value: String,
    pub line: u32,
    pub column: u32,
}

/// All checked `ResourceRef` values of `text`, in document order
pub fn resource_refs(text: &str) -> Vec<ResourceRef> {
    let text = blank_comments(text);
    let mut refs = Vec::new();

    for proxy in proxy_regex().captures_iter(&text) {
        let Some(body) = proxy.get(1) else {
            continue;
        };
        if !resource_type_regex().is_match(body.as_str()) {
            continue;
        }
        for found in resource_ref_regex().captures_iter(body.as_str()) {
            let Some(element) = found.get(0) else {
                continue;
            };
            let (line, column) = position(&text, body.start() + element.start());
            refs.push(ResourceRef {
                value: unescape(found.get(1).map_or("", |m| m.as_str())),
                line,
                column,
            });
        }
    }
    refs
}

/// Replace comments by spaces, keeping line breaks so offsets stay put
fn blank_comments(text: &str) -> String {
    comment_regex()
        .replace_all(text, |caps: &regex::Captures| {
            caps[0]
                .chars()
                .map(|c| if c == '\n' { '\n' } else { ' ' })
                .collect::<String>()
        })
        .into_owned()
}

fn position(text: &str, offset: usize) -> (u32, u32) {
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let column = before[line_start..].chars().count() + 1;
    (
        u32::try_from(line).unwrap_or(u32::MAX),
        u32::try_from(column).unwrap_or(u32::MAX),
    )
}

/// Host and port of a hierarchical URI part, empty when there is none
fn authority(rest: &str) -> &str {
    rest.strip_prefix("//")
        .and_then(|r| r.split(['/', '?', '#']).next())
        .unwrap_or("")
}

fn unescape(value: &str) -> String {
    if let Some(cdata) = value
        .trim()
        .strip_prefix("<![CDATA[")
        .and_then(|v| v.strip_suffix("]]>"))
    {
        return cdata.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// The handle check extension
pub struct CheckHandles {
    resolver: Option<Arc<HandleResolver>>,
}

impl CheckHandles {
    /// Check the syntax of handles only
    pub fn syntax_only() -> Self {
        Self { resolver: None }
    }

    /// Check the syntax and resolve every handle
    pub fn resolving(config: HandleResolverConfig) -> std::result::Result<Self, InitializationError> {
        Ok(Self::with_resolver(Arc::new(HandleResolver::new(config)?)))
    }

    pub fn with_resolver(resolver: Arc<HandleResolver>) -> Self {
        Self {
            resolver: Some(resolver),
        }
    }

    pub fn is_resolving(&self) -> bool {
        self.resolver.is_some()
    }

    pub fn resolver(&self) -> Option<Arc<HandleResolver>> {
        self.resolver.clone()
    }

    pub fn statistics(&self) -> Option<ResolverStats> {
        self.resolver.as_ref().map(|r| r.statistics())
    }

    fn check(&self, found: &ResourceRef, report: &mut Positioned<'_>) {
        let handle = found.value.trim();
        if handle.is_empty() {
            report.error("invalid handle (<ResourceRef> was empty)".to_string());
            return;
        }
        if handle != found.value {
            report.warning(format!(
                "handle '{}' contains leading or tailing spaces within <ResourceRef> element",
                found.value
            ));
        }
        self.check_syntax(handle, report);
    }

    fn check_syntax(&self, handle: &str, report: &mut Positioned<'_>) {
        let Some(scheme) = scheme_regex().captures(handle).map(|c| c[1].to_string()) else {
            report.error(format!(
                "The URI of PID '{}' is missing a proper schema part",
                handle
            ));
            return;
        };

        if scheme.eq_ignore_ascii_case(HDL_SCHEME) {
            let path = &handle[scheme.len() + 1..];
            let separator = if path.starts_with('/') { "" } else { "/" };
            match Url::parse(&format!("http://{}{}{}", HDL_PROXY_HOST, separator, path)) {
                Ok(actionable) => self.check_resolves(&actionable, report),
                Err(e) => report.error(format!("PID '{}' is not a well-formed URI: {}", handle, e)),
            }
        } else if scheme.eq_ignore_ascii_case(URN_SCHEME) {
            let unsupported = if self.is_resolving() {
                "URN resolving"
            } else {
                "URN sytax checking"
            };
            report.info(format!(
                "PID '{}' skipped, because {} is not supported",
                handle, unsupported
            ));
        } else if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
            if authority(&handle[scheme.len() + 1..]).is_empty() {
                report.error(format!("The URI of PID '{}' is missing the host part", handle));
                return;
            }
            let uri = match Url::parse(handle) {
                Ok(uri) => uri,
                Err(e) => {
                    report.error(format!("PID '{}' is not a well-formed URI: {}", handle, e));
                    return;
                }
            };
            match uri.host_str() {
                Some(host) => {
                    if !host.eq_ignore_ascii_case(HDL_PROXY_HOST) {
                        report.error(format!(
                            "The URI of PID '{}' contains an unexpected host part of '{}'",
                            handle, host
                        ));
                    }
                    self.check_resolves(&uri, report);
                }
                None => {
                    report.error(format!("The URI of PID '{}' is missing the host part", handle));
                }
            }
        } else {
            report.error(format!(
                "The URI of PID '{}' contains an unexpected schema part of '{}'",
                handle, scheme
            ));
        }
    }

    fn check_resolves(&self, uri: &Url, report: &mut Positioned<'_>) {
        let Some(resolver) = &self.resolver else {
            return;
        };
        match resolver.resolve(uri.as_str()) {
            Ok(200) => {}
            Ok(code @ (401 | 403)) => report.info(format!(
                "PID '{}' resolved to an access protected resource ({})",
                uri, code
            )),
            Ok(404) => report.error(format!(
                "PID '{}' resolved to an non-existing resource (404)",
                uri
            )),
            Ok(code) => report.warning(format!(
                "PID '{}' resolved with an unexpected result ({})",
                uri, code
            )),
            Err(FetchError::Timeout { .. }) => {
                report.warning(format!("Timeout while resolving PID '{}'", uri))
            }
            Err(FetchError::UnknownHost { host, .. }) => report.warning(format!(
                "Unable to resolve host '{}' while resolving PID '{}'",
                host, uri
            )),
            Err(err) => {
                debug!("resolving '{}' failed: {}", uri, err);
                report.warning(format!("An error occurred while resolving PID '{}'", uri))
            }
        }
    }
}

/// Adds messages positioned at one `ResourceRef`
struct Positioned<'a> {
    inner: &'a mut ValidationReport,
    line: u32,
    column: u32,
}

impl Positioned<'_> {
    fn add(&mut self, severity: Severity, text: String) {
        self.inner
            .add(Message::new(severity, text).at(Some(self.line), Some(self.column)));
    }

    fn info(&mut self, text: String) {
        self.add(Severity::Info, text);
    }

    fn warning(&mut self, text: String) {
        self.add(Severity::Warning, text);
    }

    fn error(&mut self, text: String) {
        self.add(Severity::Error, text);
    }
}

impl Extension for CheckHandles {
    fn name(&self) -> &str {
        "check-handles"
    }

    fn validate(&self, document: &Document, report: &mut ValidationReport) -> Result<()> {
        for found in resource_refs(document.text()) {
            let mut positioned = Positioned {
                inner: &mut *report,
                line: found.line,
                column: found.column,
            };
            self.check(&found, &mut positioned);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle_resolver::HandleResolverConfig;
    use tokio::runtime::Runtime;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cmdi(proxies: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<CMD xmlns="http://www.clarin.eu/cmd/">
  <Resources>
    <ResourceProxyList>
{}
    </ResourceProxyList>
  </Resources>
</CMD>"#,
            proxies
        )
    }

    fn proxy(kind: &str, reference: &str) -> String {
        format!(
            "      <ResourceProxy id=\"p\">\n        <ResourceType mimetype=\"text/plain\">{}</ResourceType>\n        <ResourceRef>{}</ResourceRef>\n      </ResourceProxy>",
            kind, reference
        )
    }

    fn check(extension: &CheckHandles, text: &str) -> ValidationReport {
        let mut report = ValidationReport::new("test.cmdi");
        extension
            .validate(&Document::new("test.cmdi", text), &mut report)
            .unwrap();
        report
    }

    fn only_message(report: &ValidationReport) -> &Message {
        assert_eq!(report.messages.len(), 1, "{:?}", report.messages);
        &report.messages[0]
    }

    #[test]
    fn test_resource_refs_filter_by_type() {
        let text = cmdi(&[
            proxy("Resource", "hdl:1839/00-0000-0000-0001"),
            proxy("LandingPage", "http://example.org/"),
            proxy("Metadata", "hdl:1839/00-0000-0000-0002"),
            "<!-- <ResourceProxy><ResourceType>Resource</ResourceType><ResourceRef>x</ResourceRef></ResourceProxy> -->".to_string(),
        ]
        .join("\n"));

        let refs = resource_refs(&text);
        let values: Vec<&str> = refs.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, ["hdl:1839/00-0000-0000-0001", "hdl:1839/00-0000-0000-0002"]);
        assert_eq!(refs[0].line, 7);
        assert_eq!(refs[0].column, 9);
    }

    #[test]
    fn test_resource_ref_entities_and_empty_elements() {
        let text = cmdi(&format!(
            "{}\n<ResourceProxy id=\"e\"><ResourceType>Resource</ResourceType><ResourceRef/></ResourceProxy>",
            proxy("Resource", "http://hdl.handle.net/1839/a?x=1&amp;y=2")
        ));
        let refs = resource_refs(&text);
        assert_eq!(refs[0].value, "http://hdl.handle.net/1839/a?x=1&y=2");
        assert_eq!(refs[1].value, "");
    }

    #[test]
    fn test_syntax_checks() {
        let extension = CheckHandles::syntax_only();

        let report = check(&extension, &cmdi(&proxy("Resource", "")));
        assert_eq!(only_message(&report).message, "invalid handle (<ResourceRef> was empty)");

        let report = check(&extension, &cmdi(&proxy("Resource", " hdl:1839/00-0000 ")));
        let message = only_message(&report);
        assert_eq!(message.severity, Severity::Warning);
        assert!(message.message.contains("leading or tailing spaces"));

        let report = check(&extension, &cmdi(&proxy("Resource", "urn:nbn:de:1234")));
        let message = only_message(&report);
        assert_eq!(message.severity, Severity::Info);
        assert!(message.message.contains("URN sytax checking is not supported"));

        let report = check(&extension, &cmdi(&proxy("Resource", "http://example.org/1839")));
        assert!(only_message(&report).message.contains("unexpected host part of 'example.org'"));

        let report = check(&extension, &cmdi(&proxy("Resource", "http://")));
        assert!(only_message(&report).message.contains("missing the host part"));

        let report = check(&extension, &cmdi(&proxy("Resource", "ftp://hdl.handle.net/1")));
        assert!(only_message(&report).message.contains("unexpected schema part of 'ftp'"));

        let report = check(&extension, &cmdi(&proxy("Resource", "1839/00-0000")));
        assert!(only_message(&report).message.contains("missing a proper schema part"));

        let report = check(&extension, &cmdi(&proxy("Resource", "https://hdl.handle.net/1839/1")));
        assert!(report.messages.is_empty());
    }

    #[test]
    fn test_resolution_outcomes() {
        let runtime = Runtime::new().unwrap();
        let server = runtime.block_on(MockServer::start());
        for (at, status) in [("/ok", 200), ("/protected", 403), ("/gone", 404), ("/odd", 500)] {
            runtime.block_on(
                Mock::given(method("HEAD"))
                    .and(path(at))
                    .respond_with(ResponseTemplate::new(status))
                    .mount(&server),
            );
        }

        let extension = CheckHandles::resolving(HandleResolverConfig::default()).unwrap();
        assert!(extension.is_resolving());
        let resolved = |at: &str| {
            let report = check(&extension, &cmdi(&proxy("Resource", &format!("{}{}", server.uri(), at))));
            // the mock server is never hdl.handle.net, so the host error comes first
            assert!(report.messages[0].message.contains("unexpected host part"));
            report.messages[1..].to_vec()
        };

        assert!(resolved("/ok").is_empty());

        let protected = resolved("/protected");
        assert_eq!(protected[0].severity, Severity::Info);
        assert!(protected[0].message.contains("access protected resource (403)"));

        let gone = resolved("/gone");
        assert_eq!(gone[0].severity, Severity::Error);
        assert!(gone[0].message.contains("non-existing resource (404)"));

        let odd = resolved("/odd");
        assert_eq!(odd[0].severity, Severity::Warning);
        assert!(odd[0].message.contains("unexpected result (500)"));

        let stats = extension.statistics().unwrap();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.cache_size, 4);

        let report = check(&extension, &cmdi(&proxy("Resource", "urn:nbn:de:1234")));
        assert!(only_message(&report).message.contains("URN resolving is not supported"));
    }
}
