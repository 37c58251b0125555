//! Session policy configuration.
//!
//! ```text
//! <config>
//!     <policy label="gui -> fb">
//!         <device type="gpu"/>
//!     </policy>
//!     <policy label_prefix="input">
//!         <device type="input"/>
//!     </policy>
//!     <default-policy/>
//! </config>
//! ```
//!
//! A session label selects its policy: an exact `label` match wins, then
//! the longest matching `label_prefix` or `label_suffix`, then the
//! `default-policy`. A label with no matching policy is refused.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::virtio::DeviceType;

/// Device types one session may lease.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    devices: Vec<DeviceType>,
}

impl Policy {
    pub fn new(devices: Vec<DeviceType>) -> Self {
        Self { devices }
    }

    pub fn permits(&self, ty: DeviceType) -> bool {
        ty.is_valid() && self.devices.contains(&ty)
    }

    pub fn devices(&self) -> &[DeviceType] {
        &self.devices
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    Label(String),
    Prefix(String),
    Suffix(String),
}

impl Selector {
    /// Match strength for `label`, exact matches beating any prefix/suffix.
    fn score(&self, label: &str) -> Option<usize> {
        match self {
            Self::Label(l) if l == label => Some(usize::MAX),
            Self::Prefix(p) if label.starts_with(p.as_str()) => Some(p.len()),
            Self::Suffix(s) if label.ends_with(s.as_str()) => Some(s.len()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    selector: Selector,
    policy: Policy,
}

/// Parsed policy document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    rules: Vec<Rule>,
    default: Option<Policy>,
}

impl Config {
    pub fn parse(doc: &str) -> Result<Self> {
        Parser::new(doc).parse()
    }

    pub fn policy_for(&self, label: &str) -> Result<&Policy> {
        self.rules
            .iter()
            .filter_map(|rule| rule.selector.score(label).map(|score| (score, &rule.policy)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, policy)| policy)
            .or(self.default.as_ref())
            .ok_or(Error::NoPolicy)
    }

    pub fn policy_count(&self) -> usize {
        self.rules.len() + self.default.is_some() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    Empty,
}

#[derive(Debug, Clone, Copy)]
struct Tag<'a> {
    name: &'a str,
    attrs: &'a str,
    kind: TagKind,
}

impl<'a> Tag<'a> {
    fn attr(&self, key: &str) -> Result<Option<&'a str>> {
        let mut rest = self.attrs.trim_start();
        while !rest.is_empty() {
            let eq = rest.find('=').ok_or(Error::InvalidConfig)?;
            let name = rest[..eq].trim();
            let value_start = rest[eq + 1..].trim_start();
            let quote = value_start.chars().next().ok_or(Error::InvalidConfig)?;
            if quote != '"' && quote != '\'' {
                return Err(Error::InvalidConfig);
            }
            let body = &value_start[1..];
            let end = body.find(quote).ok_or(Error::InvalidConfig)?;
            if name == key {
                return Ok(Some(&body[..end]));
            }
            rest = body[end + 1..].trim_start();
        }
        Ok(None)
    }
}

/// Index of the `>` closing the tag at the start of `s`, skipping quoted
/// attribute values (labels routinely contain `->`).
fn tag_end(s: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

struct Parser<'a> {
    rest: &'a str,
}

impl<'a> Parser<'a> {
    fn new(doc: &'a str) -> Self {
        Self { rest: doc }
    }

    fn skip_past(&mut self, marker: &str) -> Result<()> {
        let end = self.rest.find(marker).ok_or(Error::InvalidConfig)?;
        self.rest = &self.rest[end + marker.len()..];
        Ok(())
    }

    fn next_tag(&mut self) -> Result<Option<Tag<'a>>> {
        loop {
            let Some(start) = self.rest.find('<') else {
                return Ok(None);
            };
            self.rest = &self.rest[start..];

            if self.rest.starts_with("<!--") {
                self.skip_past("-->")?;
                continue;
            }
            if self.rest.starts_with("<?") {
                self.skip_past("?>")?;
                continue;
            }

            let end = tag_end(self.rest).ok_or(Error::InvalidConfig)?;
            let inner = &self.rest[1..end];
            self.rest = &self.rest[end + 1..];

            let (kind, inner) = if let Some(name) = inner.strip_prefix('/') {
                (TagKind::Close, name)
            } else if let Some(body) = inner.strip_suffix('/') {
                (TagKind::Empty, body)
            } else {
                (TagKind::Open, inner)
            };

            let inner = inner.trim();
            let split = inner.find(char::is_whitespace).unwrap_or(inner.len());
            let name = &inner[..split];
            if name.is_empty() {
                return Err(Error::InvalidConfig);
            }
            return Ok(Some(Tag { name, attrs: &inner[split..], kind }));
        }
    }

    fn parse(mut self) -> Result<Config> {
        let mut config = Config::default();
        let mut stack: Vec<&'a str> = Vec::new();
        // Policy being collected and its selector (None for default-policy).
        let mut current: Option<(Option<Selector>, Policy)> = None;

        while let Some(tag) = self.next_tag()? {
            if tag.kind == TagKind::Close {
                if stack.pop() != Some(tag.name) {
                    log::warn!("config: unbalanced </{}>", tag.name);
                    return Err(Error::InvalidConfig);
                }
                if tag.name == "policy" || tag.name == "default-policy" {
                    Self::finish_policy(&mut config, current.take());
                }
                continue;
            }

            let parent = stack.last().copied();
            match (parent, tag.name) {
                (None, "config") => {}
                (None, other) => {
                    log::warn!("config: unexpected root <{}>", other);
                    return Err(Error::InvalidConfig);
                }
                (Some("config"), "policy") => {
                    current = Some((Some(Self::selector(&tag)?), Policy::default()));
                }
                (Some("config"), "default-policy") => {
                    current = Some((None, Policy::default()));
                }
                (Some("policy") | Some("default-policy"), "device") => {
                    if let Some((_, policy)) = current.as_mut() {
                        Self::add_device(policy, &tag)?;
                    }
                }
                (_, other) => log::debug!("config: ignoring <{}>", other),
            }

            match tag.kind {
                TagKind::Open => stack.push(tag.name),
                TagKind::Empty => {
                    if tag.name == "policy" || tag.name == "default-policy" {
                        Self::finish_policy(&mut config, current.take());
                    }
                }
                TagKind::Close => {}
            }
        }

        if !stack.is_empty() {
            log::warn!("config: unterminated <{}>", stack[stack.len() - 1]);
            return Err(Error::InvalidConfig);
        }
        Ok(config)
    }

    fn selector(tag: &Tag<'_>) -> Result<Selector> {
        if let Some(label) = tag.attr("label")? {
            Ok(Selector::Label(String::from(label)))
        } else if let Some(prefix) = tag.attr("label_prefix")? {
            Ok(Selector::Prefix(String::from(prefix)))
        } else if let Some(suffix) = tag.attr("label_suffix")? {
            Ok(Selector::Suffix(String::from(suffix)))
        } else {
            log::warn!("config: <policy> without label selector");
            Err(Error::InvalidConfig)
        }
    }

    fn add_device(policy: &mut Policy, tag: &Tag<'_>) -> Result<()> {
        let Some(name) = tag.attr("type")? else {
            log::warn!("config: <device> without type");
            return Ok(());
        };
        match DeviceType::from_name(name) {
            Some(ty) if ty.is_valid() => {
                if !policy.devices.contains(&ty) {
                    policy.devices.push(ty);
                }
            }
            _ => log::warn!("config: unknown device type '{}'", name),
        }
        Ok(())
    }

    fn finish_policy(config: &mut Config, current: Option<(Option<Selector>, Policy)>) {
        match current {
            Some((Some(selector), policy)) => config.rules.push(Rule { selector, policy }),
            Some((None, policy)) => config.default = Some(policy),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
        <?xml version="1.0"?>
        <config>
            <!-- framebuffer gets the gpu -->
            <policy label="gui -> fb">
                <device type="gpu"/>
            </policy>
            <policy label_prefix="input">
                <device type="input"/>
                <device type="18"/>
            </policy>
            <policy label_suffix="-> storage">
                <device type="block"/>
            </policy>
            <default-policy>
                <device type="entropy"/>
            </default-policy>
        </config>
    "#;

    #[test]
    fn test_policy_selection() {
        let config = Config::parse(DOC).unwrap();
        assert_eq!(config.policy_count(), 4);

        let fb = config.policy_for("gui -> fb").unwrap();
        assert!(fb.permits(DeviceType::Gpu));
        assert!(!fb.permits(DeviceType::Input));

        let input = config.policy_for("input -> keyboard").unwrap();
        assert_eq!(input.devices(), &[DeviceType::Input]);

        assert!(config
            .policy_for("vm -> storage")
            .unwrap()
            .permits(DeviceType::Block));
        assert!(config
            .policy_for("anything")
            .unwrap()
            .permits(DeviceType::Entropy));
    }

    #[test]
    fn test_no_default_refuses_unknown_label() {
        let config = Config::parse(r#"<config><policy label="a"><device type="gpu"/></policy></config>"#)
            .unwrap();
        assert_eq!(config.policy_for("b"), Err(Error::NoPolicy));
    }

    #[test]
    fn test_malformed_documents() {
        assert!(Config::parse("<config><policy label=\"a\"></config>").is_err());
        assert!(Config::parse("<policy label=\"a\"/>").is_err());
        assert!(Config::parse("<config><policy label=a/></config>").is_err());
        assert!(Config::parse("<config><policy/></config>").is_err());
    }

    #[test]
    fn test_invalid_type_never_permitted() {
        let config = Config::parse(
            r#"<config><default-policy><device type="invalid"/><device type="bogus"/></default-policy></config>"#,
        )
        .unwrap();
        assert!(config.policy_for("x").unwrap().devices().is_empty());
    }
}
