//! DNS leak audit.
//!
//! Works purely on configuration values: the auditor reports leaks in a
//! [`NetworkProfile`] and produces a corrected copy. It never touches host
//! networking.

use serde::{Deserialize, Serialize};

/// Resolvers considered safe when a profile names none.
pub const SECURE_DNS_SERVERS: [&str; 3] = ["1.1.1.1", "9.9.9.9", "8.8.8.8"];

/// Network settings the engine routes with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkProfile {
    pub use_system_dns: bool,
    pub force_dns_proxy: bool,
    pub bypass_proxy: bool,
    /// Requests originate from a browser context.
    pub browser: bool,
    pub disable_webrtc: bool,
    pub dns_servers: Option<Vec<String>>,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            use_system_dns: false,
            force_dns_proxy: true,
            bypass_proxy: false,
            browser: false,
            disable_webrtc: false,
            dns_servers: None,
        }
    }
}

impl NetworkProfile {
    /// Whether name resolution should happen on the proxy side.
    pub fn remote_dns(&self) -> bool {
        self.force_dns_proxy && !self.use_system_dns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakSeverity {
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakKind {
    SystemDns,
    ProxyBypass,
    Webrtc,
}

impl LeakKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeakKind::SystemDns => "system_dns",
            LeakKind::ProxyBypass => "proxy_bypass",
            LeakKind::Webrtc => "webrtc",
        }
    }

    fn recommendation(&self) -> &'static str {
        match self {
            LeakKind::SystemDns => "Configure to use proxy DNS instead of system DNS",
            LeakKind::ProxyBypass => "Disable proxy bypass settings",
            LeakKind::Webrtc => "Disable WebRTC in browser configurations",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsLeak {
    pub kind: LeakKind,
    pub severity: LeakSeverity,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    pub has_leaks: bool,
    pub leaks: Vec<DnsLeak>,
    pub recommendations: Vec<String>,
}

impl LeakReport {
    pub fn summary(&self) -> String {
        self.leaks
            .iter()
            .map(|leak| leak.kind.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Proxy settings handed to a browser context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserProxySettings {
    pub http: Option<String>,
    pub dns: Option<String>,
    pub socks_remote_dns: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DnsLeakAuditor {
    secure_dns_servers: Vec<String>,
}

impl Default for DnsLeakAuditor {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsLeakAuditor {
    pub fn new() -> Self {
        Self {
            secure_dns_servers: SECURE_DNS_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn secure_dns_servers(&self) -> &[String] {
        &self.secure_dns_servers
    }

    pub fn check_for_leaks(&self, profile: &NetworkProfile) -> Vec<DnsLeak> {
        let mut leaks = Vec::new();
        if profile.use_system_dns || !profile.force_dns_proxy {
            leaks.push(DnsLeak {
                kind: LeakKind::SystemDns,
                severity: LeakSeverity::High,
                description: "Using system DNS instead of proxy DNS".to_string(),
            });
        }
        if profile.bypass_proxy {
            leaks.push(DnsLeak {
                kind: LeakKind::ProxyBypass,
                severity: LeakSeverity::High,
                description: "Proxy bypass is enabled".to_string(),
            });
        }
        if profile.browser && !profile.disable_webrtc {
            leaks.push(DnsLeak {
                kind: LeakKind::Webrtc,
                severity: LeakSeverity::Medium,
                description: "WebRTC could leak real IP address".to_string(),
            });
        }
        leaks
    }

    pub fn generate_leak_report(&self, profile: &NetworkProfile) -> LeakReport {
        let leaks = self.check_for_leaks(profile);
        let recommendations = leaks
            .iter()
            .map(|leak| leak.kind.recommendation().to_string())
            .collect();
        LeakReport {
            has_leaks: !leaks.is_empty(),
            leaks,
            recommendations,
        }
    }

    /// Corrected copy of `profile` with every reported leak closed.
    pub fn fix_leaks(&self, profile: &NetworkProfile) -> NetworkProfile {
        let mut fixed = profile.clone();
        fixed.use_system_dns = false;
        fixed.force_dns_proxy = true;
        fixed.bypass_proxy = false;
        if fixed.browser {
            fixed.disable_webrtc = true;
        }
        if fixed.dns_servers.is_none() {
            fixed.dns_servers = Some(self.secure_dns_servers.clone());
        }
        fixed
    }

    pub fn secure_browser(&self, settings: &BrowserProxySettings) -> BrowserProxySettings {
        let mut secured = settings.clone();
        if secured.dns.is_none()
            && let Some(http) = &secured.http
        {
            secured.dns = Some(http.clone());
        }
        secured.socks_remote_dns = true;
        secured
    }

    pub fn block_webrtc_leaks(&self, config: &WebRtcConfig) -> WebRtcConfig {
        let mut blocked = config.clone();
        blocked.ice_servers.clear();
        blocked
    }

    pub fn is_secure_dns_server(&self, server: &str) -> bool {
        self.secure_dns_servers.iter().any(|s| s == server)
    }

    /// Returns `false` when the server was already known.
    pub fn add_secure_dns_server(&mut self, server: impl Into<String>) -> bool {
        let server = server.into();
        if self.is_secure_dns_server(&server) {
            return false;
        }
        self.secure_dns_servers.push(server);
        true
    }
}

/// Nameservers listed in resolv.conf-formatted text.
pub fn parse_resolv_conf(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(server)) => Some(server.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_clean() {
        let auditor = DnsLeakAuditor::new();
        let report = auditor.generate_leak_report(&NetworkProfile::default());
        assert!(!report.has_leaks);
        assert!(report.recommendations.is_empty());
        assert!(NetworkProfile::default().remote_dns());
    }

    #[test]
    fn reports_and_fixes_every_leak() {
        let auditor = DnsLeakAuditor::new();
        let leaky = NetworkProfile {
            use_system_dns: true,
            force_dns_proxy: false,
            bypass_proxy: true,
            browser: true,
            disable_webrtc: false,
            dns_servers: None,
        };

        let report = auditor.generate_leak_report(&leaky);
        assert!(report.has_leaks);
        let kinds: Vec<_> = report.leaks.iter().map(|l| (l.kind, l.severity)).collect();
        assert_eq!(
            kinds,
            vec![
                (LeakKind::SystemDns, LeakSeverity::High),
                (LeakKind::ProxyBypass, LeakSeverity::High),
                (LeakKind::Webrtc, LeakSeverity::Medium),
            ]
        );
        assert_eq!(report.recommendations.len(), 3);
        assert_eq!(report.summary(), "system_dns, proxy_bypass, webrtc");

        let fixed = auditor.fix_leaks(&leaky);
        assert!(auditor.check_for_leaks(&fixed).is_empty());
        assert!(fixed.disable_webrtc);
        assert_eq!(fixed.dns_servers.as_deref().map(|s| s.len()), Some(3));
    }

    #[test]
    fn fix_keeps_configured_resolvers() {
        let auditor = DnsLeakAuditor::new();
        let profile = NetworkProfile {
            dns_servers: Some(vec!["10.0.0.53".into()]),
            ..Default::default()
        };
        let fixed = auditor.fix_leaks(&profile);
        assert_eq!(fixed.dns_servers, Some(vec!["10.0.0.53".to_string()]));
    }

    #[test]
    fn browser_helpers() {
        let auditor = DnsLeakAuditor::new();
        let secured = auditor.secure_browser(&BrowserProxySettings {
            http: Some("proxy.local:3128".into()),
            ..Default::default()
        });
        assert_eq!(secured.dns.as_deref(), Some("proxy.local:3128"));
        assert!(secured.socks_remote_dns);

        let blocked = auditor.block_webrtc_leaks(&WebRtcConfig {
            ice_servers: vec!["stun:stun.example.org".into()],
        });
        assert!(blocked.ice_servers.is_empty());
    }

    #[test]
    fn secure_server_list_dedupes() {
        let mut auditor = DnsLeakAuditor::new();
        assert!(auditor.is_secure_dns_server("1.1.1.1"));
        assert!(!auditor.add_secure_dns_server("1.1.1.1"));
        assert!(auditor.add_secure_dns_server("208.67.222.222"));
        assert!(auditor.is_secure_dns_server("208.67.222.222"));
        assert_eq!(auditor.secure_dns_servers().len(), 4);
    }

    #[test]
    fn parses_resolv_conf() {
        let content = "# generated\nsearch lan\nnameserver 192.168.1.1\n; old\nnameserver  1.1.1.1\n";
        assert_eq!(parse_resolv_conf(content), vec!["192.168.1.1", "1.1.1.1"]);
    }
}
