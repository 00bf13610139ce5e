//! Accepted findings and their suppression rules.

use crate::types::{AmwscanError, Match, Result, WhitelistEntry};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Whether every match of a file is covered by a whitelist entry.
///
/// An entry covers a match when the scanned path contains the entry's path,
/// the pattern ids and matched texts are equal and, unless `only_path_mode`
/// is set, the lines are equal. An entry without a stored match text only
/// covers matches that have no text either, such as the favicon sentinel.
/// Partial coverage does not suppress, and neither does an empty match list.
pub fn is_suppressed(
    file_path: &str,
    matches: &[Match],
    whitelist: &[WhitelistEntry],
    only_path_mode: bool,
) -> bool {
    if matches.is_empty() {
        return false;
    }

    let covered = matches
        .iter()
        .filter(|m| {
            whitelist
                .iter()
                .any(|entry| entry_covers(entry, file_path, m, only_path_mode))
        })
        .count();

    covered == matches.len()
}

fn entry_covers(entry: &WhitelistEntry, file_path: &str, m: &Match, only_path_mode: bool) -> bool {
    !entry.file.is_empty()
        && file_path.contains(&entry.file)
        && entry.pattern_id == m.pattern_id
        && entry.matched_text == m.matched_text
        && (only_path_mode || entry.line == m.line)
}

/// Whitelist file contents.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<WhitelistEntry>,
}

impl Whitelist {
    pub fn new(entries: Vec<WhitelistEntry>) -> Self {
        Self { entries }
    }

    /// Load a JSON array of entries, or the legacy `path,pattern_id,line`
    /// CSV. A missing or empty file is an empty whitelist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Whitelist {} not found, starting empty", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let entries: Vec<WhitelistEntry> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).map_err(|e| {
                AmwscanError::WhitelistError(format!("{}: {}", path.display(), e))
            })?
        } else {
            parse_csv(trimmed)
        };

        debug!("Loaded {} whitelist entries", entries.len());
        Ok(Self { entries })
    }

    /// Write the whitelist as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accept every match of `file`. Returns how many entries were new.
    pub fn add_matches(&mut self, file: &str, matches: &[Match]) -> usize {
        let mut added = 0;
        for m in matches {
            let entry = WhitelistEntry::from_match(file, m);
            if !self.entries.contains(&entry) {
                self.entries.push(entry);
                added += 1;
            }
        }
        added
    }

    pub fn is_suppressed(&self, file_path: &str, matches: &[Match], only_path_mode: bool) -> bool {
        is_suppressed(file_path, matches, &self.entries, only_path_mode)
    }
}

fn parse_csv(content: &str) -> Vec<WhitelistEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.rsplitn(3, ',').map(|f| f.trim().trim_matches('"'));
            let line_field = fields.next()?;
            let pattern_id = fields.next()?;
            let Some(file) = fields.next() else {
                warn!("Ignoring malformed whitelist line: {}", line);
                return None;
            };
            Some(WhitelistEntry {
                file: file.to_string(),
                pattern_id: pattern_id.to_string(),
                matched_text: String::new(),
                line: line_field.parse().ok(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn m(id: &str, line: Option<u32>, text: &str) -> Match {
        Match {
            pattern_id: id.to_string(),
            line,
            matched_text: text.to_string(),
        }
    }

    fn entry(file: &str, id: &str, line: Option<u32>, text: &str) -> WhitelistEntry {
        WhitelistEntry {
            file: file.to_string(),
            pattern_id: id.to_string(),
            matched_text: text.to_string(),
            line,
        }
    }

    #[test]
    fn test_all_or_nothing() {
        let matches = vec![
            m("eval", Some(1), "eval($a)"),
            m("system", Some(2), "system($b)"),
            m("hacked_by", Some(3), "hacked"),
        ];
        let mut whitelist = vec![
            entry("site/a.php", "eval", Some(1), "eval($a)"),
            entry("site/a.php", "system", Some(2), "system($b)"),
        ];
        assert!(!is_suppressed("/var/www/site/a.php", &matches, &whitelist, false));

        whitelist.push(entry("site/a.php", "hacked_by", Some(3), "hacked"));
        assert!(is_suppressed("/var/www/site/a.php", &matches, &whitelist, false));
    }

    #[test]
    fn test_line_must_match_unless_only_path() {
        let matches = vec![m("eval", Some(5), "eval($a)")];
        let whitelist = vec![entry("a.php", "eval", Some(1), "eval($a)")];
        assert!(!is_suppressed("/www/a.php", &matches, &whitelist, false));
        assert!(is_suppressed("/www/a.php", &matches, &whitelist, true));
    }

    #[test]
    fn test_path_and_text_must_match() {
        let matches = vec![m("eval", Some(1), "eval($a)")];
        assert!(!is_suppressed(
            "/www/b.php",
            &matches,
            &[entry("a.php", "eval", Some(1), "eval($a)")],
            false
        ));
        assert!(!is_suppressed(
            "/www/a.php",
            &matches,
            &[entry("a.php", "eval", Some(1), "eval($b)")],
            false
        ));
    }

    #[test]
    fn test_empty_matches_not_suppressed() {
        let whitelist = vec![entry("a.php", "eval", None, "")];
        assert!(!is_suppressed("a.php", &[], &whitelist, false));
    }

    #[test]
    fn test_favicon_sentinel_whitelisted() {
        let matches = vec![Match::infected_icon()];
        let whitelist = vec![entry("favicon_x7f2.ico", "infected_icon", None, "")];
        assert!(is_suppressed("/www/favicon_x7f2.ico", &matches, &whitelist, false));
    }

    #[test]
    fn test_load_json_and_save_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.json");
        fs::write(
            &path,
            r#"[{"file":"/www/a.php","exploit":"eval","match":"eval($a)","line":"4"}]"#,
        )
        .unwrap();

        let mut whitelist = Whitelist::load(&path).unwrap();
        assert_eq!(whitelist.len(), 1);
        assert_eq!(whitelist.entries()[0].line, Some(4));

        let added = whitelist.add_matches("/www/b.php", &[m("system", Some(2), "system(1)")]);
        assert_eq!(added, 1);
        assert_eq!(whitelist.add_matches("/www/b.php", &[m("system", Some(2), "system(1)")]), 0);
        whitelist.save(&path).unwrap();

        let reloaded = Whitelist::load(&path).unwrap();
        assert_eq!(reloaded.entries(), whitelist.entries());
    }

    #[test]
    fn test_load_legacy_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.csv");
        fs::write(&path, "/www/a,b.php,eval,3\n\n/www/c.php,hacked_by,\n").unwrap();

        let whitelist = Whitelist::load(&path).unwrap();
        assert_eq!(whitelist.len(), 2);
        assert_eq!(whitelist.entries()[0].file, "/www/a,b.php");
        assert_eq!(whitelist.entries()[0].line, Some(3));
        assert_eq!(whitelist.entries()[1].line, None);

        // Legacy entries carry no text, so they never cover a textual match
        assert!(!whitelist.is_suppressed("/www/a,b.php", &[m("eval", Some(3), "eval($x)")], false));

        fs::write(&path, "/www/favicon_x7f2.ico,infected_icon,\n").unwrap();
        let whitelist = Whitelist::load(&path).unwrap();
        assert!(whitelist.is_suppressed("/www/favicon_x7f2.ico", &[Match::infected_icon()], false));
    }

    #[test]
    fn test_textless_entry_does_not_cover_new_code() {
        let whitelist = vec![entry("a.php", "eval", None, "")];
        let injected = vec![m("eval", Some(9), "eval($_POST['new'])")];
        assert!(!is_suppressed("/www/a.php", &injected, &whitelist, true));
        assert!(!is_suppressed("/www/a.php", &injected, &whitelist, false));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let whitelist = Whitelist::load(&dir.path().join("absent.json")).unwrap();
        assert!(whitelist.is_empty());
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.json");
        fs::write(&path, "[{not json").unwrap();
        assert!(matches!(
            Whitelist::load(&path),
            Err(AmwscanError::WhitelistError(_))
        ));
    }
}
