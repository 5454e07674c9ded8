//! Parser for the bug tagging DSL.
//!
//! ```text
//! testname = (letter|digit) {letter|digit|'_'|'-'}
//! tracker  = letter {letter}
//! id       = (letter|digit) {letter|digit}
//! bugref   = tracker '#' id
//! tagging  = testname {',' testname} ':' ['!'] bugref {',' bugref}
//! taggings = tagging {tagging}
//! ```
//!
//! Whitespace may appear around `:` and `,`. A bug reference is written
//! without gaps (`bsc#1234`) and `!` must touch the reference it negates.
//!
//! Comments contain taggings mixed with arbitrary prose. The text is first
//! split into tokens, then a cursor tries to read a tagging at each token.
//! When a tagging breaks off, everything read for it is dropped and the next
//! attempt starts at the token where it broke.

use super::BugRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
  /// Run of letters, digits, `_` and `-`
  Word,
  Colon,
  Comma,
  Bang,
  Hash,
  Other,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
  kind: TokenKind,
  text: &'a str,
  start: usize,
  /// Whitespace directly precedes this token
  spaced: bool,
}

impl Token<'_> {
  fn end(&self) -> usize {
    self.start + self.text.len()
  }
}

fn is_word_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
  let mut tokens = Vec::new();
  let mut chars = text.char_indices().peekable();
  let mut spaced = false;

  while let Some((start, c)) = chars.next() {
    if c.is_whitespace() {
      spaced = true;
      continue;
    }

    let kind = match c {
      ':' => TokenKind::Colon,
      ',' => TokenKind::Comma,
      '!' => TokenKind::Bang,
      '#' => TokenKind::Hash,
      c if is_word_char(c) => TokenKind::Word,
      _ => TokenKind::Other,
    };

    let mut end = start + c.len_utf8();
    if kind == TokenKind::Word {
      while let Some(&(i, next)) = chars.peek() {
        if !is_word_char(next) {
          break;
        }
        end = i + next.len_utf8();
        chars.next();
      }
    }

    tokens.push(Token {
      kind,
      text: &text[start..end],
      start,
      spaced,
    });
    spaced = false;
  }

  tokens
}

fn is_testname(word: &str) -> bool {
  word
    .chars()
    .next()
    .is_some_and(|c| c.is_ascii_alphanumeric())
}

fn is_tracker(word: &str) -> bool {
  !word.is_empty() && word.chars().all(|c| c.is_ascii_alphabetic())
}

fn is_id(word: &str) -> bool {
  !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric())
}

/// One (testname, bug reference, polarity) triple found in a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch<'a> {
  pub test: &'a str,
  pub bugref: BugRef,
  pub negated: bool,
  /// The whole tagging this triple came from
  pub source: &'a str,
}

struct Tagging<'a> {
  tests: Vec<&'a str>,
  refs: Vec<BugRef>,
  negated: bool,
  start: usize,
  end: usize,
}

/// Restartable position over the token stream.
struct Cursor<'t, 'a> {
  tokens: &'t [Token<'a>],
  pos: usize,
}

impl<'t, 'a> Cursor<'t, 'a> {
  fn new(tokens: &'t [Token<'a>], pos: usize) -> Self {
    Self { tokens, pos }
  }

  fn peek(&self) -> Option<&'t Token<'a>> {
    self.tokens.get(self.pos)
  }

  fn peek_kind(&self) -> Option<TokenKind> {
    self.peek().map(|t| t.kind)
  }

  /// Take the next token if `accept` likes it, otherwise report where we stopped.
  fn expect(&mut self, accept: impl Fn(&Token<'a>) -> bool) -> Result<&'t Token<'a>, usize> {
    match self.tokens.get(self.pos) {
      Some(token) if accept(token) => {
        self.pos += 1;
        Ok(token)
      }
      _ => Err(self.pos),
    }
  }

  fn testname(&mut self) -> Result<&'a str, usize> {
    self
      .expect(|t| t.kind == TokenKind::Word && is_testname(t.text))
      .map(|t| t.text)
  }

  fn bugref(&mut self) -> Result<BugRef, usize> {
    let tracker = self.expect(|t| t.kind == TokenKind::Word && is_tracker(t.text))?;
    self.expect(|t| t.kind == TokenKind::Hash && !t.spaced)?;
    let id = self.expect(|t| t.kind == TokenKind::Word && !t.spaced && is_id(t.text))?;
    Ok(BugRef::new(tracker.text, id.text))
  }

  /// Read one tagging. On failure returns the index of the offending token.
  fn tagging(&mut self) -> Result<Tagging<'a>, usize> {
    let start = self.peek().map(|t| t.start).unwrap_or_default();

    let mut tests = vec![self.testname()?];
    loop {
      match self.peek_kind() {
        Some(TokenKind::Comma) => {
          self.pos += 1;
          tests.push(self.testname()?);
        }
        Some(TokenKind::Colon) => {
          self.pos += 1;
          break;
        }
        _ => return Err(self.pos),
      }
    }

    let negated = self.peek_kind() == Some(TokenKind::Bang);
    if negated {
      self.pos += 1;
    }
    let first = if negated {
      // `!` must touch the reference
      match self.peek() {
        Some(t) if t.spaced => return Err(self.pos),
        _ => self.bugref()?,
      }
    } else {
      self.bugref()?
    };

    let mut refs = vec![first];
    let mut end = self.tokens[self.pos - 1].end();

    // Further references; a comma followed by anything else ends the tagging
    // and is left for the next attempt
    while self.peek_kind() == Some(TokenKind::Comma) {
      let mut ahead = Cursor::new(self.tokens, self.pos + 1);
      match ahead.bugref() {
        Ok(bugref) => {
          refs.push(bugref);
          self.pos = ahead.pos;
          end = self.tokens[self.pos - 1].end();
        }
        Err(_) => break,
      }
    }

    Ok(Tagging {
      tests,
      refs,
      negated,
      start,
      end,
    })
  }
}

/// Try to extract the test-name:bug-ref pairs from a comment
///
/// A tagging can assign many bug references to many test names, so
/// `test1, test2: bsc#1234, gh#a33f4` tags both tests with both references.
/// Triples are returned in the order they appear, tests outermost.
pub fn parse_comment(text: &str) -> Vec<TagMatch<'_>> {
  let tokens = tokenize(text);
  let mut matches = Vec::new();
  let mut pos = 0;
  let mut resyncs = 0usize;

  while pos < tokens.len() {
    let mut cursor = Cursor::new(&tokens, pos);
    match cursor.tagging() {
      Ok(tagging) => {
        let source = &text[tagging.start..tagging.end];
        for &test in &tagging.tests {
          for bugref in &tagging.refs {
            matches.push(TagMatch {
              test,
              bugref: bugref.clone(),
              negated: tagging.negated,
              source,
            });
          }
        }
        pos = cursor.pos;
      }
      Err(failed_at) => {
        resyncs += 1;
        pos = failed_at.max(pos + 1);
      }
    }
  }

  tracing::trace!(taggings = matches.len(), resyncs, "parsed comment");
  matches
}

/// Every bare bug reference in `text`, first occurrence order, no duplicates.
pub fn parse_refs(text: &str) -> Vec<BugRef> {
  let tokens = tokenize(text);
  let mut refs: Vec<BugRef> = Vec::new();
  let mut pos = 0;

  while pos < tokens.len() {
    // A tracker glued to a preceding word is part of that word
    let glued = pos > 0 && !tokens[pos].spaced && tokens[pos - 1].kind == TokenKind::Word;
    let mut cursor = Cursor::new(&tokens, pos);
    match cursor.bugref() {
      Ok(bugref) if !glued => {
        if !refs.contains(&bugref) {
          refs.push(bugref);
        }
        pos = cursor.pos;
      }
      _ => pos += 1,
    }
  }

  refs
}
