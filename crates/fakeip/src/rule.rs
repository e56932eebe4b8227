//! Domain classification rules
//!
//! The manager can consult an external evaluator to decide whether a
//! resolved domain should be given a fake address or passed through. The
//! built-in [`ScriptRules`] evaluator reads a line-based rule script and a
//! text geo-IP database:
//!
//! ```text
//! # rule script
//! domain-suffix example.com fake
//! domain-keyword tracker direct
//! geoip CN direct
//! final fake
//! ```
//!
//! ```text
//! # geo-IP database: <cidr> <country>
//! 1.0.1.0/24 CN
//! 2001:db8::/32 ZZ
//! ```

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use ipnet::IpNet;
use tracing::info;

use crate::{FakeIpError, Result};

/// Outcome of classifying a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Substitute a fake address
    Fake,
    /// Leave the real address visible
    Direct,
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fake" => Ok(Self::Fake),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fake => f.write_str("fake"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

/// Classifies a resolved domain
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(&self, domain: &str, real: IpAddr) -> RuleAction;
}

/// Country lookup table, longest prefix wins
#[derive(Debug, Clone, Default)]
pub struct GeoIpDb {
    entries: Vec<(IpNet, String)>,
}

impl GeoIpDb {
    /// Parse `<cidr> <country>` lines
    pub fn parse(source: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (index, line) in source.lines().enumerate() {
            let line = strip_comment(line);
            if line.is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(cidr), Some(country), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(FakeIpError::RuleParse {
                    line: index + 1,
                    reason: "expected '<cidr> <country>'".to_string(),
                });
            };

            let net: IpNet = cidr.parse().map_err(|e| FakeIpError::RuleParse {
                line: index + 1,
                reason: format!("bad cidr '{}': {}", cidr, e),
            })?;
            entries.push((net.trunc(), country.to_ascii_uppercase()));
        }

        // Longest prefix first so the first hit is the most specific
        entries.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Ok(Self { entries })
    }

    /// Country code for `addr`, if any entry covers it
    pub fn lookup(&self, addr: IpAddr) -> Option<&str> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, country)| country.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Rule {
    DomainSuffix(String, RuleAction),
    DomainKeyword(String, RuleAction),
    GeoIp(String, RuleAction),
}

/// Ordered rule list; the first matching rule decides
#[derive(Debug, Clone)]
pub struct ScriptRules {
    rules: Vec<Rule>,
    fallback: RuleAction,
    geoip: GeoIpDb,
}

impl ScriptRules {
    /// Load a rule script and geo-IP database from disk
    pub fn load(script: &Path, geoip_db: &Path) -> Result<Self> {
        let db_source = read(geoip_db)?;
        let geoip = GeoIpDb::parse(&db_source).map_err(|e| FakeIpError::RuleLoad {
            path: geoip_db.to_path_buf(),
            reason: e.to_string(),
        })?;

        let script_source = read(script)?;
        let rules = Self::parse(&script_source, geoip).map_err(|e| FakeIpError::RuleLoad {
            path: script.to_path_buf(),
            reason: e.to_string(),
        })?;

        info!(
            "Loaded {} rules from {:?} ({} geo-IP entries)",
            rules.rules.len(),
            script,
            rules.geoip.len()
        );
        Ok(rules)
    }

    /// Parse a rule script against an already loaded geo-IP database
    pub fn parse(source: &str, geoip: GeoIpDb) -> Result<Self> {
        let mut rules = Vec::new();
        let mut fallback = RuleAction::Fake;

        for (index, line) in source.lines().enumerate() {
            let line = strip_comment(line);
            if line.is_empty() {
                continue;
            }
            let parse_err = |reason: String| FakeIpError::RuleParse {
                line: index + 1,
                reason,
            };

            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["final", action] => {
                    fallback = action.parse().map_err(parse_err)?;
                }
                [kind, pattern, action] => {
                    let action: RuleAction = action.parse().map_err(parse_err)?;
                    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
                    let rule = match *kind {
                        "domain-suffix" => Rule::DomainSuffix(pattern, action),
                        "domain-keyword" => Rule::DomainKeyword(pattern, action),
                        "geoip" => Rule::GeoIp(pattern.to_ascii_uppercase(), action),
                        other => return Err(parse_err(format!("unknown rule '{}'", other))),
                    };
                    rules.push(rule);
                }
                _ => return Err(parse_err(format!("malformed rule '{}'", line))),
            }
        }

        Ok(Self {
            rules,
            fallback,
            geoip,
        })
    }
}

impl RuleEvaluator for ScriptRules {
    fn evaluate(&self, domain: &str, real: IpAddr) -> RuleAction {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        for rule in &self.rules {
            let hit = match rule {
                Rule::DomainSuffix(suffix, action) => {
                    let matched = domain == *suffix
                        || domain
                            .strip_suffix(suffix.as_str())
                            .is_some_and(|head| head.ends_with('.'));
                    matched.then_some(*action)
                }
                Rule::DomainKeyword(word, action) => domain.contains(word.as_str()).then_some(*action),
                Rule::GeoIp(country, action) => {
                    (self.geoip.lookup(real) == Some(country.as_str())).then_some(*action)
                }
            };
            if let Some(action) = hit {
                return action;
            }
        }

        self.fallback
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => line[..pos].trim(),
        None => line.trim(),
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| FakeIpError::RuleLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const GEOIP: &str = "\
# sample database
1.0.0.0/8 AU
1.0.1.0/24 cn
";

    const SCRIPT: &str = "\
domain-suffix example.com direct
domain-keyword ads fake   # trailing comment
geoip CN direct
final fake
";

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn rules() -> ScriptRules {
        ScriptRules::parse(SCRIPT, GeoIpDb::parse(GEOIP).unwrap()).unwrap()
    }

    #[test]
    fn test_geoip_longest_prefix() {
        let db = GeoIpDb::parse(GEOIP).unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.lookup(ip(1, 0, 1, 9)), Some("CN"));
        assert_eq!(db.lookup(ip(1, 2, 3, 4)), Some("AU"));
        assert_eq!(db.lookup(ip(8, 8, 8, 8)), None);
    }

    #[test]
    fn test_domain_suffix_matches_label_boundary() {
        let rules = rules();
        assert_eq!(rules.evaluate("example.com", ip(9, 9, 9, 9)), RuleAction::Direct);
        assert_eq!(rules.evaluate("www.Example.com.", ip(9, 9, 9, 9)), RuleAction::Direct);
        assert_eq!(rules.evaluate("badexample.com", ip(9, 9, 9, 9)), RuleAction::Fake);
    }

    #[test]
    fn test_keyword_and_geoip_rules() {
        let rules = rules();
        assert_eq!(rules.evaluate("ads.tracker.net", ip(1, 0, 1, 1)), RuleAction::Fake);
        assert_eq!(rules.evaluate("cdn.net", ip(1, 0, 1, 1)), RuleAction::Direct);
        assert_eq!(rules.evaluate("cdn.net", ip(1, 9, 9, 9)), RuleAction::Fake);
    }

    #[test]
    fn test_final_sets_fallback() {
        let rules = ScriptRules::parse("final direct", GeoIpDb::default()).unwrap();
        assert_eq!(rules.evaluate("anything.org", ip(5, 5, 5, 5)), RuleAction::Direct);
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let err = ScriptRules::parse("\n\ndomain-suffix a.com proxy", GeoIpDb::default()).unwrap_err();
        assert!(matches!(err, FakeIpError::RuleParse { line: 3, .. }));

        let err = ScriptRules::parse("ip-cidr 10.0.0.0/8 fake", GeoIpDb::default()).unwrap_err();
        assert!(matches!(err, FakeIpError::RuleParse { line: 1, .. }));

        let err = GeoIpDb::parse("1.0.0.0/8").unwrap_err();
        assert!(matches!(err, FakeIpError::RuleParse { line: 1, .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScriptRules::load(
            Path::new("/nonexistent/meshtun/rules.txt"),
            Path::new("/nonexistent/meshtun/geoip.txt"),
        )
        .unwrap_err();
        assert!(matches!(err, FakeIpError::RuleLoad { .. }));
    }

    #[test]
    fn test_action_round_trip_through_display() {
        for action in [RuleAction::Fake, RuleAction::Direct] {
            assert_eq!(action.to_string().parse::<RuleAction>().unwrap(), action);
        }
    }
}
