// The rule language is line-oriented: one rule per line, blank lines and
// #-comments ignored, a trailing comment allowed after a complete rule. The
// grammar layer (peg, over bytes so hex escapes can denote arbitrary octets)
// produces raw options in source order; compile() turns them into validated
// rules and compiles regexes so evaluation can never fail at runtime.

use anyhow::Context as _;
use std::{collections, fmt, str};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
  Alert,
  Block,
  Admit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
  Client,
  Server,
}

impl Side {
  pub fn index(self) -> usize {
    match self {
      Side::Client => 0,
      Side::Server => 1,
    }
  }
}

impl fmt::Display for Side {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Side::Client => write!(formatter, "client"),
      Side::Server => write!(formatter, "server"),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateOp {
  Is(String),
  Not(String),
  Set(String),
  Unset(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Suffix {
  Depth(u64),
  Replace(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RawOption {
  Name(Vec<u8>),
  Match {
    bytes: Vec<u8>,
    depth: Option<u64>,
    replace: Option<Vec<u8>>,
  },
  Regex(Vec<u8>),
  Side(Side),
  State(StateOp),
  Flush(Side),
  Skip(u64),
  Replace(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq)]
pub struct RawRule {
  pub kind: Kind,
  pub options: Vec<RawOption>,
}

fn fold_suffixes(suffixes: Vec<Suffix>) -> Result<(Option<u64>, Option<Vec<u8>>), &'static str> {
  let (mut depth, mut replace) = (None, None);
  for suffix in suffixes {
    match suffix {
      Suffix::Depth(value) => {
        if depth.replace(value).is_some() {
          return Err("a single depth");
        }
      }
      Suffix::Replace(bytes) => {
        if replace.replace(bytes).is_some() {
          return Err("a single replacement");
        }
      }
    }
  }
  Ok((depth, replace))
}

peg::parser! {
  grammar parser() for [u8] {
    rule _() = [b' ' | b'\t']*

    rule uint() -> u64
      = n:$([b'0'..=b'9']+)
      {? str::from_utf8(n).unwrap(/* digits only */).parse().or(Err("number")) }

    rule ident() -> String
      = s:$([b'a'..=b'z' | b'A'..=b'Z' | b'_'] [b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_']*)
      { str::from_utf8(s).unwrap(/* ASCII by construction */).to_string() }

    rule hex() -> u8
      = c:[b'0'..=b'9'] { c - b'0' }
      / c:[b'a'..=b'f'] { c - b'a' + 10 }
      / c:[b'A'..=b'F'] { c - b'A' + 10 }

    // C-style escapes; \xHH resolves to an arbitrary octet. Anything else
    // after a backslash is kept verbatim so regex escapes (\C, \;, \d, ...)
    // reach the regex compiler untouched.
    rule escape() -> Vec<u8>
      = "\\x" high:hex() low:hex() { vec![high * 16 + low] }
      / "\\n" { vec![b'\n'] }
      / "\\r" { vec![b'\r'] }
      / "\\t" { vec![b'\t'] }
      / "\\0" { vec![b'\0'] }
      / "\\\\" { vec![b'\\'] }
      / "\\\"" { vec![b'"'] }
      / "\\" c:[_] { vec![b'\\', c] }

    rule qchar() -> Vec<u8>
      = e:escape() { e }
      / !("\"" / "\\") c:[_] { vec![c] }

    rule qstring() -> Vec<u8>
      = "\"" cs:qchar()* "\""
      { cs.concat() }

    rule side() -> Side
      = "client" { Side::Client }
      / "server" { Side::Server }

    rule state_op() -> StateOp
      = "is" _() "," _() i:ident() { StateOp::Is(i) }
      / "not" _() "," _() i:ident() { StateOp::Not(i) }
      / "set" _() "," _() i:ident() { StateOp::Set(i) }
      / "unset" _() "," _() i:ident() { StateOp::Unset(i) }

    rule suffix() -> Suffix
      = d:uint() { Suffix::Depth(d) }
      / "replace" _() ":" _() s:qstring() { Suffix::Replace(s) }

    rule option() -> RawOption
      = "name" _() ":" _() s:qstring() { RawOption::Name(s) }
      / "match" _() ":" _() s:qstring() sfx:(_() "," _() x:suffix() { x })*
        {?
          let (depth, replace) = fold_suffixes(sfx)?;
          Ok(RawOption::Match { bytes: s, depth, replace })
        }
      / "regex" _() ":" _() s:qstring() { RawOption::Regex(s) }
      / "side" _() ":" _() s:side() { RawOption::Side(s) }
      / "state" _() ":" _() s:state_op() { RawOption::State(s) }
      / "flush" _() ":" _() s:side() { RawOption::Flush(s) }
      / "skip" _() ":" _() n:uint() { RawOption::Skip(n) }
      / "replace" _() ":" _() s:qstring() { RawOption::Replace(s) }

    rule kind() -> Kind
      = "alert" { Kind::Alert }
      / "block" { Kind::Block }
      / "admit" { Kind::Admit }

    rule entry() -> RawRule
      = k:kind() _() "(" _() os:(o:option() _() ";" _() { o })+ ")"
      { RawRule { kind: k, options: os } }

    rule comment() = "#" [_]*

    pub rule line() -> Option<RawRule>
      = _() r:entry() _() comment()? { Some(r) }
      / _() comment()? { None }
  }
}

/// Parses a whole rule file into raw rules in source order.
pub fn parse(input: &[u8]) -> anyhow::Result<Vec<RawRule>> {
  let mut rules = Vec::new();
  for (number, line) in input.split(|byte| *byte == b'\n').enumerate() {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if let Some(rule) = parser::line(line)
      .with_context(|| format!("syntax error on line {}", number + 1))?
    {
      rules.push(rule);
    }
  }
  Ok(rules)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchTerm {
  pub bytes: Vec<u8>,
  /// Accumulated skip:N directives preceding this term.
  pub skip: u64,
  /// The term must end within this many bytes of its search base.
  pub depth: Option<u64>,
  pub replace: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Rule {
  pub id: usize,
  pub name: String,
  pub kind: Kind,
  pub side: Option<Side>,
  pub terms: Vec<MatchTerm>,
  pub regex: Option<regex::bytes::Regex>,
  pub states: Vec<StateOp>,
  pub flush: Option<Side>,
}

impl Rule {
  pub fn applies_to(&self, side: Side) -> bool {
    self.side.map_or(true, |wanted| wanted == side)
  }
}

// The regex crate spells "match any byte, UTF-8 or not" as (?s-u:.); PCRE
// spells it \C. Translated here so rule files can use the PCRE form.
fn translate_regex(pattern: &str) -> String {
  let mut translated = String::with_capacity(pattern.len());
  let mut characters = pattern.chars();
  while let Some(character) = characters.next() {
    if character != '\\' {
      translated.push(character);
      continue;
    }
    match characters.next() {
      Some('C') => translated.push_str("(?s-u:.)"),
      Some(other) => {
        translated.push('\\');
        translated.push(other);
      }
      None => translated.push('\\'),
    }
  }
  translated
}

fn compile_rule(id: usize, raw: RawRule) -> anyhow::Result<Rule> {
  let mut name = None;
  let mut side = None;
  let mut terms: Vec<MatchTerm> = Vec::new();
  let mut regex = None;
  let mut states = Vec::new();
  let mut flush = None;
  let mut skip = 0u64;
  for option in raw.options {
    match option {
      RawOption::Name(bytes) => {
        anyhow::ensure!(name.is_none(), "a rule takes a single name");
        let string = String::from_utf8(bytes).ok().context("name isn't UTF-8")?;
        anyhow::ensure!(!string.is_empty(), "name is empty");
        name = Some(string);
      }
      RawOption::Match { bytes, depth, replace } => {
        anyhow::ensure!(!bytes.is_empty(), "match is empty");
        anyhow::ensure!(regex.is_none(), "match and regex are mutually exclusive");
        if let Some(replace) = &replace {
          anyhow::ensure!(!replace.is_empty(), "replacement is empty");
        }
        terms.push(MatchTerm {
          bytes,
          skip: std::mem::take(&mut skip),
          depth,
          replace,
        });
      }
      RawOption::Regex(bytes) => {
        anyhow::ensure!(terms.is_empty(), "match and regex are mutually exclusive");
        anyhow::ensure!(regex.is_none(), "a rule takes a single regex");
        anyhow::ensure!(skip == 0, "skip must be followed by a match");
        anyhow::ensure!(!bytes.is_empty(), "regex is empty");
        let pattern = str::from_utf8(&bytes).context("regex isn't UTF-8")?;
        regex = Some(
          regex::bytes::Regex::new(&translate_regex(pattern))
            .with_context(|| format!("couldn't compile regex {pattern:?}"))?,
        );
      }
      RawOption::Side(wanted) => {
        anyhow::ensure!(side.is_none(), "a rule takes a single side");
        side = Some(wanted);
      }
      RawOption::State(op) => states.push(op),
      RawOption::Flush(target) => {
        anyhow::ensure!(flush.is_none(), "a rule takes a single flush");
        flush = Some(target);
      }
      RawOption::Skip(count) => {
        skip = skip
          .checked_add(count)
          .context("skip overflows")?;
      }
      RawOption::Replace(bytes) => {
        anyhow::ensure!(!bytes.is_empty(), "replacement is empty");
        let term = terms
          .last_mut()
          .context("replace without a preceding match")?;
        anyhow::ensure!(
          term.replace.replace(bytes).is_none(),
          "a match takes a single replacement"
        );
      }
    }
  }
  anyhow::ensure!(skip == 0, "skip must be followed by a match");
  let name = name.context("missing name")?;
  anyhow::ensure!(
    flush.is_none() || side.is_some(),
    "flush requires a side"
  );
  anyhow::ensure!(
    !terms.is_empty() || regex.is_some() || !states.is_empty() || flush.is_some(),
    "a rule needs a match, a regex, a state or a flush"
  );
  Ok(Rule {
    id,
    name,
    kind: raw.kind,
    side,
    terms,
    regex,
    states,
    flush,
  })
}

/// Validates raw rules and compiles their patterns; ids follow file order.
pub fn compile(parsed: Vec<RawRule>) -> anyhow::Result<Vec<Rule>> {
  let mut names = collections::HashSet::new();
  let mut rules = Vec::with_capacity(parsed.len());
  for (id, raw) in parsed.into_iter().enumerate() {
    let rule = compile_rule(id, raw).with_context(|| format!("invalid rule {}", id + 1))?;
    anyhow::ensure!(
      names.insert(rule.name.clone()),
      "duplicate rule name {:?}",
      rule.name
    );
    rules.push(rule);
  }
  Ok(rules)
}

fn quote(bytes: &[u8]) -> String {
  let mut string = String::with_capacity(bytes.len() + 2);
  string.push('"');
  for byte in bytes {
    match byte {
      b'"' => string.push_str("\\\""),
      b'\\' => string.push_str("\\\\"),
      0x20..=0x7e => string.push(*byte as char),
      other => string.push_str(&format!("\\x{other:02x}")),
    }
  }
  string.push('"');
  string
}

impl fmt::Display for RawRule {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self.kind {
      Kind::Alert => write!(formatter, "alert (")?,
      Kind::Block => write!(formatter, "block (")?,
      Kind::Admit => write!(formatter, "admit (")?,
    }
    for option in &self.options {
      match option {
        RawOption::Name(bytes) => write!(formatter, "name:{}", quote(bytes))?,
        RawOption::Match { bytes, depth, replace } => {
          write!(formatter, "match:{}", quote(bytes))?;
          if let Some(depth) = depth {
            write!(formatter, ", {depth}")?;
          }
          if let Some(replace) = replace {
            write!(formatter, ", replace:{}", quote(replace))?;
          }
        }
        RawOption::Regex(bytes) => write!(formatter, "regex:{}", quote(bytes))?,
        RawOption::Side(side) => write!(formatter, "side:{side}")?,
        RawOption::State(StateOp::Is(i)) => write!(formatter, "state:is,{i}")?,
        RawOption::State(StateOp::Not(i)) => write!(formatter, "state:not,{i}")?,
        RawOption::State(StateOp::Set(i)) => write!(formatter, "state:set,{i}")?,
        RawOption::State(StateOp::Unset(i)) => write!(formatter, "state:unset,{i}")?,
        RawOption::Flush(side) => write!(formatter, "flush:{side}")?,
        RawOption::Skip(count) => write!(formatter, "skip:{count}")?,
        RawOption::Replace(bytes) => write!(formatter, "replace:{}", quote(bytes))?,
      }
      write!(formatter, "; ")?;
    }
    write!(formatter, ")")
  }
}
