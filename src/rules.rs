use std::path::Path;

use regex::Regex;
use tracing::warn;

use crate::{
    domain::{DetectionRule, LOCAL_RULE_ID, Tag},
    xray::{Runtime, RuntimeError},
};

/// Reads the newline-delimited local rule file. Blank lines are skipped; every other line
/// becomes one rule with [`LOCAL_RULE_ID`]. An unreadable file yields no local rules.
pub fn load_local_rules(path: &Path) -> Vec<DetectionRule> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), %err, "read local rule list failed; using none");
            return Vec::new();
        }
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| DetectionRule {
            id: LOCAL_RULE_ID,
            pattern: line.to_string(),
        })
        .collect()
}

/// Local rules first, then control-plane rules. Patterns that do not compile are dropped.
pub fn merge_rules(local: &[DetectionRule], remote: Vec<DetectionRule>) -> Vec<DetectionRule> {
    local
        .iter()
        .cloned()
        .chain(remote)
        .filter(|rule| match Regex::new(&rule.pattern) {
            Ok(_) => true,
            Err(err) => {
                warn!(rule_id = rule.id, pattern = %rule.pattern, %err, "dropping invalid detection rule");
                false
            }
        })
        .collect()
}

pub async fn update_rule(
    runtime: &dyn Runtime,
    tag: &Tag,
    rules: Vec<DetectionRule>,
) -> Result<(), RuntimeError> {
    runtime.update_rules(tag.to_string(), rules).await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn rule(id: i64, pattern: &str) -> DetectionRule {
        DetectionRule {
            id,
            pattern: pattern.to_string(),
        }
    }

    #[test]
    fn local_rules_skip_blank_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rules.txt");
        std::fs::write(&path, "(.*\\.)?torrent\\.com\n\n   \nbt\\.example\r\n").unwrap();

        assert_eq!(
            load_local_rules(&path),
            vec![rule(-1, "(.*\\.)?torrent\\.com"), rule(-1, "bt\\.example")]
        );
    }

    #[test]
    fn missing_rule_file_yields_no_rules() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(load_local_rules(&tmp.path().join("nope")), vec![]);
    }

    #[test]
    fn merge_puts_local_first_and_drops_invalid() {
        let merged = merge_rules(
            &[rule(-1, "local"), rule(-1, "(unclosed")],
            vec![rule(4, "remote"), rule(5, "[bad")],
        );
        assert_eq!(merged, vec![rule(-1, "local"), rule(4, "remote")]);
    }
}
