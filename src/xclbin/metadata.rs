//! Embedded-metadata descriptor validation.
//!
//! The embedded-metadata section is a small XML document describing the
//! platform the image was built for. This shim only needs to verify the
//! `project > platform > device > core` element chain and read the
//! project name; a purpose-built scanner is enough for that fixed shape
//! and avoids pulling a full XML stack into the crate.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("embedded metadata is not valid UTF-8")]
    NotText,
    #[error("embedded metadata is missing the <{0}> element")]
    MissingElement(&'static str),
    #[error("embedded metadata project has no name attribute")]
    MissingProjectName,
}

/// Validated platform descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMetadata {
    /// Project name from the descriptor's root element.
    pub project_name: String,
}

impl PlatformMetadata {
    /// Validate the descriptor and extract the project name.
    ///
    /// The `project > platform > device > core` chain must be present in
    /// nesting order; anything else in the document is ignored.
    pub fn parse(data: &[u8]) -> Result<Self, MetadataError> {
        let text = std::str::from_utf8(data).map_err(|_| MetadataError::NotText)?;

        let (project_at, project_attrs) =
            find_element(text, 0, "project").ok_or(MetadataError::MissingElement("project"))?;
        let (platform_at, _) = find_element(text, project_at, "platform")
            .ok_or(MetadataError::MissingElement("platform"))?;
        let (device_at, _) = find_element(text, platform_at, "device")
            .ok_or(MetadataError::MissingElement("device"))?;
        find_element(text, device_at, "core").ok_or(MetadataError::MissingElement("core"))?;

        let project_name =
            attribute(project_attrs, "name").ok_or(MetadataError::MissingProjectName)?;

        Ok(Self { project_name })
    }
}

/// Locate the opening tag of `name` at or after `from`.
///
/// Returns the position just past the tag and the tag's attribute text.
fn find_element<'a>(text: &'a str, from: usize, name: &str) -> Option<(usize, &'a str)> {
    let mut search_at = from;
    loop {
        let rel = text[search_at..].find('<')?;
        let tag_start = search_at + rel + 1;
        let rest = &text[tag_start..];

        if rest.starts_with(name) {
            // The tag name must end at whitespace, '>' or '/'.
            let after = rest[name.len()..].chars().next();
            if matches!(after, Some(c) if c.is_whitespace() || c == '>' || c == '/') {
                let close_rel = rest.find('>')?;
                let attrs = rest[name.len()..close_rel].trim_end_matches('/');
                return Some((tag_start + close_rel + 1, attrs));
            }
        }
        search_at = tag_start;
    }
}

/// Extract a `key="value"` attribute from a tag's attribute text.
fn attribute(attrs: &str, key: &str) -> Option<String> {
    let mut rest = attrs;
    while let Some(eq) = rest.find('=') {
        let name = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let quote = after.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let value_end = after[1..].find(quote)?;
        let value = &after[1..1 + value_end];
        if name == key {
            return Some(value.to_string());
        }
        rest = &after[1 + value_end + 1..];
    }
    None
}
