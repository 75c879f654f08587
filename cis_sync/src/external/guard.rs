//! Statement guards applied before any SQL reaches the external source.

use std::sync::OnceLock;

use dashmap::DashSet;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::ExternalDialect;
use crate::{Error, Result};

const PREVIEW_CHARS: usize = 80;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\d+|\?").expect("static regex"))
}

/// Whitespace-collapsed statement, truncated for logs.
pub fn preview(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= PREVIEW_CHARS {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}

/// First keyword of a statement, uppercased. Empty for blank input.
pub fn leading_verb(sql: &str) -> String {
    sql.trim_start()
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Byte offset of the first `;` outside a string literal that is followed by
/// more SQL. MySQL also escapes quotes with a backslash inside literals.
fn stacked_statement(sql: &str, dialect: ExternalDialect) -> Option<usize> {
    let backslash_escapes = dialect == ExternalDialect::MySql;
    let mut in_quote = false;
    let mut escaped = false;
    for (i, ch) in sql.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quote && backslash_escapes => escaped = true,
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => {
                if !sql[i + 1..].trim().is_empty() {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Reject anything that is not a single SELECT statement.
pub fn check_read_only(sql: &str, dialect: ExternalDialect) -> Result<()> {
    let verb = leading_verb(sql);
    if verb != "SELECT" {
        return Err(Error::ReadOnlyViolation {
            verb: if verb.is_empty() { "<empty>".to_string() } else { verb },
            preview: preview(sql),
        });
    }
    if let Some(rest) = stacked_statement(sql, dialect) {
        let next = leading_verb(&sql[rest..]);
        return Err(Error::ReadOnlyViolation {
            verb: if next == "SELECT" { "STACKED".to_string() } else { next },
            preview: preview(sql),
        });
    }
    Ok(())
}

/// Canonical form used for allowlist membership: single spaces, lowercase,
/// every placeholder spelled `?`, no trailing semicolon.
pub fn normalize(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = collapsed.to_lowercase();
    let canonical = placeholder_re().replace_all(&lowered, "?");
    canonical.trim_end_matches(';').trim_end().to_string()
}

pub fn fingerprint(sql: &str) -> String {
    let digest = Sha256::digest(normalize(sql).as_bytes());
    hex::encode(digest)
}

/// Set of query-template fingerprints permitted against the external source.
///
/// An empty allowlist admits every SELECT; the verb guard still applies.
#[derive(Debug, Default)]
pub struct QueryAllowlist {
    fingerprints: DashSet<String>,
}

impl QueryAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, S>(&self, templates: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for t in templates {
            self.fingerprints.insert(fingerprint(t.as_ref()));
        }
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn clear(&self) {
        self.fingerprints.clear();
    }

    pub fn check(&self, sql: &str) -> Result<()> {
        if self.fingerprints.is_empty() {
            return Ok(());
        }
        let fp = fingerprint(sql);
        if self.fingerprints.contains(&fp) {
            Ok(())
        } else {
            Err(Error::QueryNotAllowed { fingerprint: fp })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_every_write_verb_in_any_case() {
        let statements = [
            "INSERT INTO users (id) VALUES (1)",
            "update users set email = 'x'",
            "  Delete FROM payments",
            "\n\tCREATE TABLE t (id int)",
            "alter table users add column x int",
            "DROP TABLE users",
            "grant all on users to bob",
            "call wipe()",
            "begin",
        ];
        for sql in statements {
            let expected = sql.split_whitespace().next().unwrap().to_ascii_uppercase();
            match check_read_only(sql, ExternalDialect::Postgres) {
                Err(Error::ReadOnlyViolation { verb, .. }) => assert_eq!(verb, expected, "{sql}"),
                other => panic!("{sql}: expected violation, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_empty_and_blank() {
        for sql in ["", "   ", "\n\t"] {
            assert!(matches!(
                check_read_only(sql, ExternalDialect::Postgres),
                Err(Error::ReadOnlyViolation { .. })
            ));
        }
    }

    #[test]
    fn accepts_select_any_case() {
        check_read_only("select 1", ExternalDialect::Postgres).unwrap();
        check_read_only("  SELECT id FROM users WHERE id = $1;", ExternalDialect::Postgres).unwrap();
        check_read_only("SELECT ';' AS semi FROM users", ExternalDialect::Postgres).unwrap();
    }

    #[test]
    fn rejects_stacked_statements() {
        match check_read_only("SELECT 1; DROP TABLE users", ExternalDialect::Postgres) {
            Err(Error::ReadOnlyViolation { verb, .. }) => assert_eq!(verb, "DROP"),
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn mysql_backslash_escape_does_not_hide_a_stacked_statement() {
        let sql = r"SELECT id FROM users WHERE email = 'a\''; DROP TABLE users";
        match check_read_only(sql, ExternalDialect::MySql) {
            Err(Error::ReadOnlyViolation { verb, .. }) => assert_eq!(verb, "DROP"),
            other => panic!("expected violation, got {other:?}"),
        }
        check_read_only(r"SELECT 'it\'s; fine' FROM users", ExternalDialect::MySql).unwrap();
        // Postgres literals end at the quote after the backslash.
        assert!(check_read_only(r"SELECT 'a\'; DROP TABLE users", ExternalDialect::Postgres).is_err());
    }

    #[test]
    fn preview_is_truncated() {
        let long = format!("INSERT INTO t VALUES ({})", "1, ".repeat(100));
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
    }

    #[test]
    fn normalization_ignores_layout_and_placeholder_style() {
        let a = "SELECT id\n  FROM users WHERE updated_at > $1 LIMIT $2";
        let b = "select id from users where updated_at > ? limit ?;";
        assert_eq!(normalize(a), normalize(b));
        assert_eq!(fingerprint(a), fingerprint(b));
        assert_eq!(fingerprint(a).len(), 64);
    }

    #[test]
    fn allowlist_membership() {
        let list = QueryAllowlist::new();
        list.check("SELECT anything FROM anywhere").unwrap();

        list.register(["SELECT id FROM users WHERE id > $1"]);
        list.check("select id   from users where id > $1").unwrap();
        assert!(matches!(
            list.check("SELECT password FROM users"),
            Err(Error::QueryNotAllowed { .. })
        ));
    }
}
