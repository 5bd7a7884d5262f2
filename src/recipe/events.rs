// src/recipe/events.rs

//! YAML event stream
//!
//! serde_yaml does the lexing; a `DeserializeSeed` walks each document with
//! `deserialize_any` and flattens it into the event sequence the recipe
//! parser's state machine consumes. Scalars are delivered as text; booleans
//! and numbers are interpreted by the parser in context.
//!
//! serde_yaml does not expose node positions, so event lines come from a
//! forward-only locator over the source text. The same locator recovers the
//! written form of numeric scalars, so `1.10` stays `1.10` instead of going
//! through an `f64`. The locator never moves
//! backwards, which keeps line numbers monotonic even when a scalar text
//! cannot be found verbatim (quoted or folded scalars).

use crate::error::{Error, Result};
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    StreamStart,
    DocumentStart,
    MappingStart,
    MappingEnd,
    SequenceStart,
    SequenceEnd,
    Scalar(String),
    DocumentEnd,
    StreamEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// 1-based source line
    pub line: usize,
}

/// Produce the full event stream for a YAML buffer
pub fn tokenize(source: &str) -> Result<Vec<Event>> {
    let mut sink = EventSink {
        events: Vec::new(),
        locator: LineLocator::new(source),
    };
    sink.push(EventKind::StreamStart);

    for document in serde_yaml::Deserializer::from_str(source) {
        sink.push(EventKind::DocumentStart);
        EventSeed { sink: &mut sink }
            .deserialize(document)
            .map_err(|e| {
                let line = e.location().map(|l| l.line()).unwrap_or(sink.locator.line());
                Error::parse(line, "document", e.to_string())
            })?;
        sink.push(EventKind::DocumentEnd);
    }

    sink.push(EventKind::StreamEnd);
    Ok(sink.events)
}

struct EventSink<'s> {
    events: Vec<Event>,
    locator: LineLocator<'s>,
}

impl EventSink<'_> {
    fn push(&mut self, kind: EventKind) {
        let line = self.locator.line();
        self.events.push(Event { kind, line });
    }

    fn scalar(&mut self, text: String) {
        let line = self.locator.advance_to(&text);
        self.events.push(Event {
            kind: EventKind::Scalar(text),
            line,
        });
    }

    /// Emit a number using its source spelling when the locator finds it
    fn number(&mut self, matches: impl Fn(&str) -> bool, rendered: String) {
        let (text, line) = match self.locator.advance_to_number(matches) {
            Some(found) => found,
            None => (rendered, self.locator.line()),
        };
        self.events.push(Event {
            kind: EventKind::Scalar(text),
            line,
        });
    }
}

/// Forward-only scanner mapping scalar texts to source lines
struct LineLocator<'s> {
    source: &'s str,
    cursor: usize,
}

impl<'s> LineLocator<'s> {
    fn new(source: &'s str) -> Self {
        Self { source, cursor: 0 }
    }

    fn line(&self) -> usize {
        self.source[..self.cursor].matches('\n').count() + 1
    }

    fn advance_to(&mut self, text: &str) -> usize {
        // Multi-line scalars are located by their first line
        let needle = text.lines().next().unwrap_or("").trim();
        if !needle.is_empty() {
            if let Some(offset) = self.source[self.cursor..].find(needle) {
                let found = self.cursor + offset;
                let line = self.source[..found].matches('\n').count() + 1;
                self.cursor = found + needle.len();
                return line;
            }
        }
        self.line()
    }

    /// Find the next plain token accepted by `matches`, skipping comments
    fn advance_to_number(&mut self, matches: impl Fn(&str) -> bool) -> Option<(String, usize)> {
        let rest = &self.source[self.cursor..];
        let mut start = None;
        let mut in_comment = false;
        let mut prev = ' ';
        for (i, c) in rest.char_indices().chain(std::iter::once((rest.len(), '\n'))) {
            if in_comment {
                in_comment = c != '\n';
            } else if c == '#' && start.is_none() && prev.is_whitespace() {
                in_comment = true;
            } else if c.is_whitespace() || matches!(c, ',' | ':' | '[' | ']' | '{' | '}') {
                if let Some(s) = start.take() {
                    let token = &rest[s..i];
                    if matches(token) {
                        let found = self.cursor + s;
                        let line = self.source[..found].matches('\n').count() + 1;
                        self.cursor = found + token.len();
                        return Some((token.to_string(), line));
                    }
                }
            } else if start.is_none() {
                start = Some(i);
            }
            prev = c;
        }
        None
    }
}

struct EventSeed<'a, 's> {
    sink: &'a mut EventSink<'s>,
}

impl<'de> DeserializeSeed<'de> for EventSeed<'_, '_> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(EventVisitor { sink: self.sink })
    }
}

struct EventVisitor<'a, 's> {
    sink: &'a mut EventSink<'s>,
}

impl<'de> Visitor<'de> for EventVisitor<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a YAML node")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<(), E> {
        self.sink.scalar(v.to_string());
        Ok(())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<(), E> {
        self.sink
            .number(|t| t.replace('_', "").parse::<i64>() == Ok(v), v.to_string());
        Ok(())
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<(), E> {
        self.sink
            .number(|t| t.replace('_', "").parse::<u64>() == Ok(v), v.to_string());
        Ok(())
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<(), E> {
        // Debug keeps the fractional part ("1.0" rather than "1")
        self.sink
            .number(|t| t.parse::<f64>() == Ok(v), format!("{v:?}"));
        Ok(())
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<(), E> {
        self.sink.scalar(v.to_string());
        Ok(())
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<(), E> {
        self.sink.scalar(v);
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<(), E> {
        self.sink.scalar(String::new());
        Ok(())
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<(), E> {
        self.visit_unit()
    }

    fn visit_some<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        self.sink.push(EventKind::SequenceStart);
        while seq
            .next_element_seed(EventSeed {
                sink: &mut *self.sink,
            })?
            .is_some()
        {}
        self.sink.push(EventKind::SequenceEnd);
        Ok(())
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        self.sink.push(EventKind::MappingStart);
        while map
            .next_key_seed(EventSeed {
                sink: &mut *self.sink,
            })?
            .is_some()
        {
            map.next_value_seed(EventSeed {
                sink: &mut *self.sink,
            })?;
        }
        self.sink.push(EventKind::MappingEnd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<EventKind> {
        tokenize(source).unwrap().into_iter().map(|e| e.kind).collect()
    }

    fn scalar(s: &str) -> EventKind {
        EventKind::Scalar(s.to_string())
    }

    #[test]
    fn test_mapping_and_sequence_events() {
        let events = kinds("a: 1\nb: [x, y]\n");
        assert_eq!(
            events,
            vec![
                EventKind::StreamStart,
                EventKind::DocumentStart,
                EventKind::MappingStart,
                scalar("a"),
                scalar("1"),
                scalar("b"),
                EventKind::SequenceStart,
                scalar("x"),
                scalar("y"),
                EventKind::SequenceEnd,
                EventKind::MappingEnd,
                EventKind::DocumentEnd,
                EventKind::StreamEnd,
            ]
        );
    }

    #[test]
    fn test_scalar_text_preserved() {
        let events = kinds("v: 1.0\nb: true\nn:\n");
        assert!(events.contains(&scalar("1.0")));
        assert!(events.contains(&scalar("true")));
        assert!(events.contains(&scalar("")));
    }

    #[test]
    fn test_number_spelling_preserved() {
        let events = kinds("a: 1.10\nb: [2.010, 3]\nc: 1_000 # 5\nd: 3.0e1\n");
        assert!(events.contains(&scalar("1.10")));
        assert!(events.contains(&scalar("2.010")));
        assert!(events.contains(&scalar("1_000")));
        assert!(events.contains(&scalar("3.0e1")));
    }

    #[test]
    fn test_number_after_comment_keeps_line() {
        let events = tokenize("# 1.5 is old\nv: 1.50\n").unwrap();
        let v = events.iter().find(|e| e.kind == scalar("1.50")).unwrap();
        assert_eq!(v.line, 2);
    }

    #[test]
    fn test_scalar_lines() {
        let events = tokenize("project:\n  name: hello\n  version: 1.2.3\n").unwrap();
        let version = events
            .iter()
            .find(|e| e.kind == scalar("1.2.3"))
            .unwrap();
        assert_eq!(version.line, 3);
    }

    #[test]
    fn test_syntax_error_has_line() {
        let err = tokenize("a: [1, 2\nb: c\n").unwrap_err();
        match err {
            Error::Parse { line, .. } => assert!(line >= 1),
            other => panic!("unexpected error: {other}"),
        }
    }
}
