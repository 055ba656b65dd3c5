// Per-connection rule evaluation. Each direction owns a ring buffer and one
// cursor per rule; the named-state set is shared by both directions. Every
// ingest walks the rules in file order, advancing cursors durably so matches
// can straddle chunk boundaries, and reports what must happen to the chunk
// about to be forwarded.

use crate::{buffer, rules};
use std::{collections, sync};

#[derive(Clone, Copy, Debug, Default)]
struct Cursor {
  /// Absolute offset to resume searching from.
  offset: u64,
  /// Index of the next awaited match term.
  term: usize,
}

#[derive(Debug)]
struct SideState {
  ring: buffer::Ring,
  cursors: Vec<Cursor>,
}

#[derive(Debug)]
struct Replacement {
  start: u64,
  end: u64,
  bytes: Vec<u8>,
}

/// What one ingest decided: the bytes to forward (empty when blocked, with
/// replacements substituted otherwise) and the rules that fired, in order.
#[derive(Debug)]
pub struct Verdict {
  pub payload: Vec<u8>,
  pub matched: Vec<usize>,
  pub blocked: bool,
}

enum Advance {
  Fire { end: u64, progressed: bool },
  Pending,
}

pub struct Inspector {
  rules: sync::Arc<Vec<rules::Rule>>,
  sides: [SideState; 2],
  states: collections::HashSet<String>,
}

impl Inspector {
  pub fn new(rules: sync::Arc<Vec<rules::Rule>>, window: usize) -> Self {
    let cursors = vec![Cursor::default(); rules.len()];
    Self {
      sides: [
        SideState {
          ring: buffer::Ring::new(window),
          cursors: cursors.clone(),
        },
        SideState {
          ring: buffer::Ring::new(window),
          cursors,
        },
      ],
      states: collections::HashSet::new(),
      rules,
    }
  }

  /// Appends a chunk to the side's window and evaluates every applicable
  /// rule. Within one ingest rules fire in file order and a rule keeps firing
  /// while its cursor makes progress, so one chunk can fire a rule several
  /// times. A block aborts the remaining rules and drops the payload.
  pub fn ingest(&mut self, side: rules::Side, chunk: &[u8]) -> Verdict {
    let chunk_start = self.sides[side.index()].ring.end();
    if self.sides[side.index()].ring.append(chunk) {
      log::info!("truncating inspection buffer");
    }
    let rules = self.rules.clone();
    let mut replacements = Vec::new();
    let mut matched = Vec::new();
    let mut blocked = false;
    'rules: for rule in rules.iter() {
      if !rule.applies_to(side) {
        continue;
      }
      loop {
        if !self.predicates_hold(rule) {
          break;
        }
        let advance = if rule.regex.is_some() {
          self.advance_regex(side, rule)
        } else {
          self.advance_terms(side, rule, chunk_start, &mut replacements)
        };
        match advance {
          Advance::Pending => break,
          Advance::Fire { end, progressed } => {
            matched.push(rule.id);
            if self.dispatch(side, rule, end) {
              blocked = true;
              break 'rules;
            }
            // Rules without a matcher (and zero-width regex matches) fire at
            // most once per ingest.
            if !progressed {
              break;
            }
          }
        }
      }
    }
    let payload = if blocked {
      Vec::new()
    } else {
      substitute(chunk, chunk_start, &mut replacements)
    };
    Verdict {
      payload,
      matched,
      blocked,
    }
  }

  fn predicates_hold(&self, rule: &rules::Rule) -> bool {
    rule.states.iter().all(|op| match op {
      rules::StateOp::Is(state) => self.states.contains(state),
      rules::StateOp::Not(state) => !self.states.contains(state),
      rules::StateOp::Set(_) | rules::StateOp::Unset(_) => true,
    })
  }

  fn advance_regex(&mut self, side: rules::Side, rule: &rules::Rule) -> Advance {
    let Some(regex) = &rule.regex else {
      return Advance::Pending;
    };
    let SideState { ring, cursors } = &mut self.sides[side.index()];
    let (base, window) = ring.window();
    let cursor = &mut cursors[rule.id];
    // The cursor may lag behind the window base after an eviction.
    let from = (cursor.offset.max(base) - base) as usize;
    match regex.find_at(window, from) {
      Some(found) => {
        let end = base + found.end() as u64;
        let progressed = end > cursor.offset;
        cursor.offset = end;
        Advance::Fire { end, progressed }
      }
      None => Advance::Pending,
    }
  }

  fn advance_terms(
    &mut self,
    side: rules::Side,
    rule: &rules::Rule,
    chunk_start: u64,
    replacements: &mut Vec<Replacement>,
  ) -> Advance {
    let SideState { ring, cursors } = &mut self.sides[side.index()];
    let (base, window) = ring.window();
    let window_end = base + window.len() as u64;
    let cursor = &mut cursors[rule.id];
    while cursor.term < rule.terms.len() {
      let term = &rule.terms[cursor.term];
      let search_base = cursor.offset.saturating_add(term.skip);
      // A depth bounds how far past the search base the term may end.
      let bound = match term.depth {
        Some(depth) => search_base.saturating_add(depth).min(window_end),
        None => window_end,
      };
      let start = search_base.max(base);
      if start >= bound || bound - start < term.bytes.len() as u64 {
        // The searchable region (so far) can't hold the term.
        return Advance::Pending;
      }
      let region = &window[(start - base) as usize..(bound - base) as usize];
      match memchr::memmem::find(region, &term.bytes) {
        Some(position) => {
          let matched_start = start + position as u64;
          let matched_end = matched_start + term.bytes.len() as u64;
          if let Some(replace) = &term.replace {
            // Substitution happens at term match time; a match entirely
            // inside already-forwarded chunks is too late to rewrite.
            if matched_end > chunk_start {
              replacements.push(Replacement {
                start: matched_start,
                end: matched_end,
                bytes: replace.clone(),
              });
            }
          }
          cursor.offset = matched_end;
          cursor.term += 1;
        }
        None => return Advance::Pending,
      }
    }
    cursor.term = 0;
    Advance::Fire {
      end: cursor.offset,
      progressed: !rule.terms.is_empty(),
    }
  }

  fn dispatch(&mut self, side: rules::Side, rule: &rules::Rule, end: u64) -> bool {
    for op in &rule.states {
      match op {
        rules::StateOp::Set(state) => {
          self.states.insert(state.clone());
        }
        rules::StateOp::Unset(state) => {
          self.states.remove(state);
        }
        rules::StateOp::Is(_) | rules::StateOp::Not(_) => (),
      }
    }
    let blocked = match rule.kind {
      rules::Kind::Alert => {
        log::info!("filter matched: '{}'", rule.name);
        false
      }
      rules::Kind::Block => {
        log::info!("blocking connection: filter matched '{}'", rule.name);
        true
      }
      rules::Kind::Admit => {
        self.consume(side, end);
        false
      }
    };
    if let Some(target) = rule.flush {
      self.flush(target);
    }
    blocked
  }

  /// Consumes everything up to the matched region's end: the bytes leave the
  /// window and every rule on the side resumes past them.
  fn consume(&mut self, side: rules::Side, through: u64) {
    let SideState { ring, cursors } = &mut self.sides[side.index()];
    ring.discard_through(through);
    for cursor in cursors.iter_mut() {
      cursor.offset = cursor.offset.max(through);
    }
  }

  fn flush(&mut self, side: rules::Side) {
    let SideState { ring, cursors } = &mut self.sides[side.index()];
    let end = ring.end();
    ring.discard_through(end);
    for cursor in cursors.iter_mut() {
      *cursor = Cursor { offset: end, term: 0 };
    }
  }
}

fn substitute(chunk: &[u8], chunk_start: u64, replacements: &mut Vec<Replacement>) -> Vec<u8> {
  if replacements.is_empty() {
    return chunk.to_vec();
  }
  replacements.sort_by_key(|replacement| replacement.start);
  let mut output = Vec::with_capacity(chunk.len());
  let mut position = 0;
  for replacement in replacements.iter() {
    let start = (replacement.start.max(chunk_start) - chunk_start) as usize;
    let end = (replacement.end - chunk_start) as usize;
    if start < position {
      // Overlapping matches, the earlier replacement wins.
      continue;
    }
    output.extend_from_slice(&chunk[position..start]);
    // The part of the match already forwarded with a previous chunk can't be
    // recalled, substitute the unforwarded tail only.
    let forwarded = (replacement.start.max(chunk_start) - replacement.start) as usize;
    output.extend_from_slice(&replacement.bytes[forwarded.min(replacement.bytes.len())..]);
    position = end;
  }
  output.extend_from_slice(&chunk[position..]);
  output
}
