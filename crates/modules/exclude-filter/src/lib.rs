//! Exclusion rules for connection events.
//!
//! A rule string is a `;` separated list of groups. Each group is a list of
//! `key=value` conditions joined either by `&&` or by `||`, never both:
//!
//! ```text
//! dport=53; dip='10.0.0.0/8' && keyword=curl; container=redis || container=etcd
//! ```
//!
//! Supported keys:
//! - `dport`: destination port equals the value
//! - `dip`: destination address equals the value, or belongs to it when the
//!   value is a CIDR network
//! - `keyword`: process path contains the value
//! - `container`: container name contains the value
//!
//! An event is excluded when any group matches. Parsing never fails: unknown
//! keys and malformed conditions are ignored, and groups left without
//! conditions are dropped.

use std::fmt;

use lightmon_core::event::EnrichedEvent;

mod cidr;

pub use cidr::{Cidr, CidrError};

/// A single `key=value` test against an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `None` when the port couldn't be parsed, and then nothing matches.
    Port(Option<u16>),
    Ip(String),
    Network(Cidr),
    Keyword(String),
    Container(String),
}

impl Condition {
    fn parse(text: &str) -> Option<Self> {
        let (key, value) = text.split_once('=')?;
        let value = value.trim().trim_matches(['\'', '"']);

        let condition = match key.trim() {
            "dport" => Condition::Port(parse_port(value)),
            "dip" if value.contains('/') => match value.parse() {
                Ok(network) => Condition::Network(network),
                Err(err) => {
                    log::debug!("{err}, matching {value:?} literally");
                    Condition::Ip(value.to_string())
                }
            },
            "dip" => Condition::Ip(value.to_string()),
            "keyword" => Condition::Keyword(value.to_string()),
            "container" => Condition::Container(value.to_string()),
            unknown => {
                log::debug!("ignoring exclusion condition with unknown key {unknown:?}");
                return None;
            }
        };
        Some(condition)
    }

    pub fn matches(&self, event: &EnrichedEvent) -> bool {
        match self {
            Condition::Port(port) => *port == Some(event.dest_port),
            // mapped IPv4 addresses are compared in dotted form
            Condition::Ip(ip) => event
                .dest_ip
                .is_some_and(|dest| dest.to_canonical().to_string() == *ip),
            Condition::Network(network) => {
                event.dest_ip.is_some_and(|dest| network.contains(&dest))
            }
            Condition::Keyword(keyword) => event.process_path.contains(keyword.as_str()),
            Condition::Container(name) => event.container_name.contains(name.as_str()),
        }
    }
}

/// Only plain decimal digits, a sign is not a port.
fn parse_port(value: &str) -> Option<u16> {
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Port(Some(port)) => write!(f, "dport={port}"),
            Condition::Port(None) => write!(f, "dport=<invalid>"),
            Condition::Ip(ip) => write!(f, "dip={ip}"),
            Condition::Network(network) => write!(f, "dip={network}"),
            Condition::Keyword(keyword) => write!(f, "keyword={keyword}"),
            Condition::Container(name) => write!(f, "container={name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Combinator {
    And,
    #[default]
    Or,
}

impl Combinator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Combinator::And => "&&",
            Combinator::Or => "||",
        }
    }
}

/// Conditions joined by a single operator. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterGroup {
    combinator: Combinator,
    conditions: Vec<Condition>,
}

impl FilterGroup {
    fn parse(text: &str) -> Option<Self> {
        let combinator = if text.contains(" && ") {
            Combinator::And
        } else {
            Combinator::Or
        };

        let conditions: Vec<Condition> = text
            .split(combinator.as_str())
            .map(str::trim)
            .filter_map(Condition::parse)
            .collect();

        if conditions.is_empty() {
            log::debug!("ignoring exclusion group without valid conditions: {text:?}");
            return None;
        }
        Some(Self {
            combinator,
            conditions,
        })
    }

    pub fn combinator(&self) -> Combinator {
        self.combinator
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, event: &EnrichedEvent) -> bool {
        match self.combinator {
            Combinator::And => self.conditions.iter().all(|c| c.matches(event)),
            Combinator::Or => self.conditions.iter().any(|c| c.matches(event)),
        }
    }
}

impl fmt::Display for FilterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = format!(" {} ", self.combinator.as_str());
        let conditions: Vec<String> = self.conditions.iter().map(ToString::to_string).collect();
        f.write_str(&conditions.join(&separator))
    }
}

/// Parsed exclusion rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeFilter {
    groups: Vec<FilterGroup>,
}

impl ExcludeFilter {
    /// Parses a rule string. Anything that doesn't make sense is skipped, so an
    /// empty or garbled string excludes nothing.
    pub fn parse(rules: &str) -> Self {
        let groups = rules
            .split(';')
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .filter_map(FilterGroup::parse)
            .collect();
        Self { groups }
    }

    pub fn groups(&self) -> &[FilterGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn should_exclude(&self, event: &EnrichedEvent) -> bool {
        self.groups.iter().any(|group| group.matches(event))
    }
}

impl fmt::Display for ExcludeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.groups.iter().map(ToString::to_string).collect();
        f.write_str(&groups.join("; "))
    }
}
