//! Splits an oversized application log record into several pieces, each
//! within `max_log_message_length`, stitched together with continuation
//! markers so a human reading the log stream can follow the message across
//! pieces.

use response_sink::AppLogLine;

/// Appended to every piece except the last.
const SUFFIX: &str = "\n<continued in next message>";
/// Prepended to every piece except the first, when doing so doesn't push the
/// piece back over the size limit.
const PREFIX: &str = "<continued from previous message>\n";

/// Split `record.message` into one or more [`AppLogLine`]s, each at most
/// `max_log_message_length` bytes (excluding, in rare cases, a prefix that
/// didn't fit -- see below). Each piece inherits the original record's
/// level, timestamp, and source location. A message no longer than the limit
/// is returned unchanged as a single-element vector.
pub fn split_log_record(record: &AppLogLine, max_log_message_length: usize) -> Vec<AppLogLine> {
    if record.message.len() <= max_log_message_length {
        return vec![record.clone()];
    }
    let pieces = split_message(&record.message, max_log_message_length);
    pieces
        .into_iter()
        .map(|message| AppLogLine {
            level: record.level,
            timestamp_us: record.timestamp_us,
            message,
            source_location: record.source_location.clone(),
        })
        .collect()
}

/// Core splitting algorithm, operating on plain strings so it can be unit-
/// and property-tested without constructing `AppLogLine`s.
fn split_message(message: &str, max_len: usize) -> Vec<String> {
    let mut contents = Vec::new();
    let mut rest = message;
    loop {
        if rest.len() <= max_len {
            contents.push((rest.to_string(), true));
            break;
        }
        let window_end = floor_char_boundary(rest, max_len);
        let window = &rest[..window_end];
        let min_cut = max_len / 10;
        let cut = window
            .rfind('\n')
            .map(|pos| pos + 1)
            .filter(|&cut| cut >= min_cut)
            .unwrap_or_else(|| {
                let mut c = max_len.saturating_sub(SUFFIX.len());
                while c > 0 && !rest.is_char_boundary(c) {
                    c -= 1;
                }
                c
            });
        // A degenerate config (e.g. a window smaller than one multi-byte
        // char) could drive the cut to zero; always make forward progress.
        let cut = cut.max(1).min(rest.len());
        let cut = floor_char_boundary(rest, cut);
        contents.push((rest[..cut].to_string(), false));
        rest = &rest[cut..];
    }
    let last = contents.len() - 1;
    contents
        .into_iter()
        .enumerate()
        .map(|(i, (content, is_terminal))| {
            let mut piece = content;
            if !is_terminal {
                debug_assert!(i != last);
                piece.push_str(SUFFIX);
            }
            if i > 0 && PREFIX.len() + piece.len() <= max_len {
                piece = format!("{PREFIX}{piece}");
            }
            piece
        })
        .collect()
}

/// Step back from `idx` to the nearest valid UTF-8 char boundary at or
/// before it. Rust strings are UTF-8, not UTF-16, so there's no literal
/// surrogate pair to straddle -- this is the equivalent safeguard against
/// splitting a multi-byte code point in half.
fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use response_sink::{
        LogLevel,
        SourceLocation,
    };

    use super::*;

    fn line(message: &str) -> AppLogLine {
        AppLogLine {
            level: LogLevel::Warn,
            timestamp_us: 42,
            message: message.to_string(),
            source_location: Some(SourceLocation {
                file: "app.js".to_string(),
                line: 7,
                function: "handler".to_string(),
            }),
        }
    }

    #[test]
    fn message_at_exactly_the_limit_is_not_split() {
        let message = "x".repeat(1024);
        let pieces = split_log_record(&line(&message), 1024);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].message, message);
    }

    #[test]
    fn message_one_over_the_limit_splits_into_exactly_two() {
        let message = "x".repeat(1025);
        let pieces = split_log_record(&line(&message), 1024);
        assert_eq!(pieces.len(), 2);
        assert!(pieces[0].message.ends_with("<continued in next message>"));
        assert!(pieces[1]
            .message
            .starts_with("<continued from previous message>\n"));
    }

    #[test]
    fn every_piece_inherits_level_timestamp_and_source_location() {
        let message = "x".repeat(3000);
        let original = line(&message);
        let pieces = split_log_record(&original, 1024);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert_eq!(piece.level, original.level);
            assert_eq!(piece.timestamp_us, original.timestamp_us);
            assert_eq!(piece.source_location, original.source_location);
        }
    }

    #[test]
    fn splits_on_newline_boundaries_when_available() {
        // A 2500-byte message with newlines at positions 900 and 1800,
        // max_log_message_length=1024.
        let mut message = "a".repeat(900);
        message.push('\n');
        message.push_str(&"b".repeat(899));
        message.push('\n');
        message.push_str(&"c".repeat(699));
        assert_eq!(message.len(), 2500);

        let pieces = split_log_record(&line(&message), 1024);
        assert_eq!(pieces.len(), 3);
        assert!(pieces[0].message.ends_with("<continued in next message>"));
        assert!(pieces[0].message.starts_with(&"a".repeat(900)));
        assert!(pieces[1]
            .message
            .starts_with("<continued from previous message>\n"));
        assert!(pieces[1].message.ends_with("<continued in next message>"));
        assert!(pieces[2]
            .message
            .starts_with("<continued from previous message>\n"));
        assert!(!pieces[2].message.ends_with("<continued in next message>"));
    }

    #[test]
    fn surrogate_pair_equivalent_code_point_is_preserved_whole() {
        // A 4-byte UTF-8 scalar value straddling the naive cut point must
        // stay intact in one piece or the other, never split mid-encoding.
        let emoji = '\u{1F980}'; // crab, 4 bytes in UTF-8
        let mut message = "x".repeat(1021);
        message.push(emoji);
        message.push_str(&"y".repeat(100));
        let pieces = split_log_record(&line(&message), 1024);
        let rejoined: String = pieces
            .iter()
            .map(|p| {
                p.message
                    .trim_start_matches("<continued from previous message>\n")
                    .trim_end_matches("\n<continued in next message>")
            })
            .collect();
        assert_eq!(rejoined, message);
        for piece in &pieces {
            assert!(piece.message.is_char_boundary(0));
            assert!(std::str::from_utf8(piece.message.as_bytes()).is_ok());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn split_then_rejoin_recovers_the_original_message(
            message in "[ -~\n]{0,4000}",
        ) {
            let pieces = split_log_record(&line(&message), 1024);
            let rejoined: String = pieces
                .iter()
                .map(|p| {
                    p.message
                        .trim_start_matches("<continued from previous message>\n")
                        .trim_end_matches("\n<continued in next message>")
                })
                .collect();
            prop_assert_eq!(rejoined, message);
        }

        #[test]
        fn every_piece_is_valid_utf8_and_bounded(message in "\\PC{0,4000}") {
            let pieces = split_log_record(&line(&message), 1024);
            for piece in &pieces {
                prop_assert!(std::str::from_utf8(piece.message.as_bytes()).is_ok());
            }
        }
    }
}
