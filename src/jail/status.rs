//! Status tool output format
//!
//! Each line is one jail. Tokens are split like a POSIX shell would split
//! them, then read as `key=value` pairs or bare flags (`key` with an empty
//! value). Parsed with nom.

use crate::error::{Error, Result};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, take_till},
    character::complete::{anychar, char, multispace0},
    combinator::{all_consuming, map},
    multi::{fold_many0, fold_many1, many0},
    sequence::{delimited, preceded, terminated},
};
use std::collections::BTreeMap;

/// One line of status output
pub type Record = BTreeMap<String, String>;

fn push(mut acc: String, piece: String) -> String {
    acc.push_str(&piece);
    acc
}

fn bare(input: &str) -> IResult<&str, String> {
    map(is_not(" \t\r\n'\"\\"), String::from).parse(input)
}

fn escaped(input: &str) -> IResult<&str, String> {
    map(preceded(char('\\'), anychar), String::from).parse(input)
}

fn single_quoted(input: &str) -> IResult<&str, String> {
    map(
        delimited(char('\''), take_till(|c| c == '\''), char('\'')),
        String::from,
    )
    .parse(input)
}

// Inside double quotes a backslash only escapes `"` and `\`
fn double_quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((
                map(is_not("\"\\"), String::from),
                map(preceded(char('\\'), anychar), |c| match c {
                    '"' | '\\' => c.to_string(),
                    other => format!("\\{}", other),
                }),
            )),
            String::new,
            push,
        ),
        char('"'),
    )
    .parse(input)
}

fn token(input: &str) -> IResult<&str, String> {
    fold_many1(
        alt((bare, single_quoted, double_quoted, escaped)),
        String::new,
        push,
    )
    .parse(input)
}

/// Split a line into shell words
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    all_consuming(preceded(multispace0, many0(terminated(token, multispace0))))
        .parse(line)
        .map(|(_, tokens)| tokens)
        .map_err(|_| Error::InvalidInput(format!("unbalanced quoting in status line: {}", line)))
}

/// Parse a single status line into a record
pub fn parse_record(line: &str) -> Result<Record> {
    let mut record = Record::new();
    for token in tokenize(line)? {
        match token.split_once('=') {
            Some((key, value)) => record.insert(key.to_string(), value.to_string()),
            None => record.insert(token, String::new()),
        };
    }
    Ok(record)
}

/// Parse every non-blank line of status output
pub fn parse_records(output: &str) -> Result<Vec<Record>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_record)
        .collect()
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s.chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\'))
}

fn quote(s: &str) -> String {
    if !needs_quoting(s) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Render a record as a status line that parses back to the same record
///
/// Empty values are written as bare flags.
pub fn render(record: &Record) -> String {
    record
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                quote(key)
            } else {
                quote(&format!("{}={}", key, value))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_tokenize_quotes() {
        let tokens = tokenize(r#"name=web host.hostname="web server" path='/a b' x\ y"#).unwrap();
        assert_eq!(
            tokens,
            vec!["name=web", "host.hostname=web server", "path=/a b", "x y"]
        );
    }

    #[test]
    fn test_tokenize_double_quote_escapes() {
        let tokens = tokenize(r#""a\"b" "c\d" "e\\f""#).unwrap();
        assert_eq!(tokens, vec![r#"a"b"#, r"c\d", r"e\f"]);
    }

    #[test]
    fn test_tokenize_unbalanced() {
        assert!(tokenize("name='web").is_err());
        assert!(tokenize("name=\"web").is_err());
        assert!(tokenize("trailing\\").is_err());
    }

    #[test]
    fn test_parse_flags_and_pairs() {
        let rec = parse_record("devfs_ruleset=4 nodying persist name=web jid=3").unwrap();
        assert_eq!(rec["name"], "web");
        assert_eq!(rec["jid"], "3");
        assert_eq!(rec["nodying"], "");
        assert_eq!(rec["persist"], "");
    }

    #[test]
    fn test_value_keeps_later_equals() {
        let rec = parse_record("exec.start='sh /etc/rc' osrelease=a=b").unwrap();
        assert_eq!(rec["exec.start"], "sh /etc/rc");
        assert_eq!(rec["osrelease"], "a=b");
    }

    #[test]
    fn test_parse_records_skips_blank_lines() {
        let recs = parse_records("name=a jid=1\n\n   \nname=b jid=2\n").unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1]["name"], "b");
    }

    #[test]
    fn test_render_round_trip() {
        let samples = [
            record(&[("name", "web"), ("jid", "12")]),
            record(&[("name", "db"), ("persist", ""), ("path", "/jails/db/root")]),
            record(&[("name", "x"), ("host.hostname", "it's a \"test\" box")]),
            record(&[("name", "y"), ("exec.start", "/bin/sh /etc/rc"), ("tab", "a\tb")]),
            record(&[("name", "z"), ("backslash", "c:\\dir")]),
        ];

        for rec in samples {
            let line = render(&rec);
            assert_eq!(parse_record(&line).unwrap(), rec, "line was {line}");
        }
    }
}
