//! robots.txt parsing and matching.
//!
//! Groups are formed by consecutive `User-agent` lines; the group naming our
//! agent wins over `*`. Within a group the longest matching pattern decides,
//! and `Allow` wins ties. Patterns support `*` and a trailing `$`.

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsGroup {
    pub agents: Vec<String>,
    pub allow: Vec<String>,
    pub disallow: Vec<String>,
    pub crawl_delay: Option<Duration>,
}

impl RobotsGroup {
    fn names(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        let product = ua.split('/').next().unwrap_or_default();
        self.agents.iter().any(|agent| {
            let agent = agent.to_ascii_lowercase();
            agent != "*" && (agent == ua || agent == product)
        })
    }

    fn is_wildcard(&self) -> bool {
        self.agents.iter().any(|agent| agent == "*")
    }
}

/// Parsed directives for one host.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotsDirectives {
    pub groups: Vec<RobotsGroup>,
    pub sitemaps: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

impl RobotsDirectives {
    /// No rules: everything allowed, no crawl delay.
    pub fn allow_all() -> Self {
        Self {
            groups: Vec::new(),
            sitemaps: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            groups: vec![RobotsGroup {
                agents: vec!["*".to_string()],
                allow: Vec::new(),
                disallow: vec!["/".to_string()],
                crawl_delay: None,
            }],
            sitemaps: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<RobotsGroup> = Vec::new();
        let mut sitemaps = Vec::new();
        let mut current: Option<RobotsGroup> = None;
        let mut collecting_agents = false;

        for raw in content.lines() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    if !collecting_agents {
                        if let Some(group) = current.take() {
                            groups.push(group);
                        }
                        current = Some(RobotsGroup::default());
                        collecting_agents = true;
                    }
                    if let Some(group) = current.as_mut()
                        && !value.is_empty()
                    {
                        group.agents.push(value.to_string());
                    }
                }
                "allow" | "disallow" | "crawl-delay" => {
                    collecting_agents = false;
                    let Some(group) = current.as_mut() else {
                        continue;
                    };
                    match directive.as_str() {
                        // An empty Disallow allows everything.
                        "disallow" if !value.is_empty() => group.disallow.push(value.to_string()),
                        "allow" if !value.is_empty() => group.allow.push(value.to_string()),
                        "crawl-delay" => {
                            if let Ok(seconds) = value.parse::<f64>()
                                && seconds.is_finite()
                                && seconds >= 0.0
                            {
                                group.crawl_delay = Some(Duration::from_secs_f64(seconds));
                            }
                        }
                        _ => {}
                    }
                }
                "sitemap" => sitemaps.push(value.to_string()),
                _ => {}
            }
        }
        if let Some(group) = current {
            groups.push(group);
        }

        Self {
            groups,
            sitemaps,
            fetched_at: Utc::now(),
        }
    }

    /// Groups naming `user_agent`, falling back to the `*` groups.
    fn applicable(&self, user_agent: &str) -> Vec<&RobotsGroup> {
        let named: Vec<&RobotsGroup> = self.groups.iter().filter(|g| g.names(user_agent)).collect();
        if !named.is_empty() {
            return named;
        }
        self.groups.iter().filter(|g| g.is_wildcard()).collect()
    }

    /// `path` should include the query string when present.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let groups = self.applicable(user_agent);
        let disallow = longest_match(path, groups.iter().flat_map(|g| g.disallow.iter()));
        let Some(disallow) = disallow else {
            return true;
        };
        let allow = longest_match(path, groups.iter().flat_map(|g| g.allow.iter()));
        allow.is_some_and(|allow| allow >= disallow)
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.applicable(user_agent)
            .into_iter()
            .filter_map(|g| g.crawl_delay)
            .max()
    }
}

fn longest_match<'a>(path: &str, patterns: impl Iterator<Item = &'a String>) -> Option<usize> {
    patterns.filter_map(|p| match_length(path, p)).max()
}

/// Specificity of `pattern` when it matches `path`: the pattern length
/// without wildcards and anchor.
fn match_length(path: &str, pattern: &str) -> Option<usize> {
    let (body, anchored) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };
    let specificity = body.chars().filter(|c| *c != '*').count();
    wildcard_match(path, body, anchored).then_some(specificity)
}

fn wildcard_match(path: &str, pattern: &str, anchored: bool) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    if !path.starts_with(first) {
        return false;
    }
    let mut pos = first.len();
    if rest.is_empty() {
        return !anchored || pos == path.len();
    }

    for (index, part) in rest.iter().enumerate() {
        let last = index == rest.len() - 1;
        if last && anchored {
            // Final segment must sit at the very end.
            return path.len() >= pos + part.len() && path.ends_with(part);
        }
        if part.is_empty() {
            continue;
        }
        match path[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }
    true
}
