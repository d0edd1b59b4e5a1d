//! Parser turning a regex-style pattern into a [`Matcher`] tree.
//!
//! The accepted syntax is the common core of the usual regex dialects:
//! literals, `.`, anchors, character classes, groups, alternation, greedy
//! quantifiers, lookaheads and `\Q...\E` quoting. Constructs outside that
//! core fail with an explicit unsupported error instead of silently
//! matching differently.

use super::matcher::{CharClass, Matcher, REPEAT_UNBOUNDED};
use super::PatternError;

pub(crate) fn parse(pattern: &str) -> Result<Matcher, PatternError> {
    let mut p = Parser {
        chars: pattern.chars().collect(),
        pos: 0,
    };
    let m = p.alternation()?;
    if p.peek().is_some() {
        // Only an unbalanced ')' can stop the top-level alternation.
        return Err(PatternError::UnbalancedParen);
    }
    Ok(m)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn alternation(&mut self) -> Result<Matcher, PatternError> {
        let mut branches = vec![self.sequence()?];
        while self.eat('|') {
            branches.push(self.sequence()?);
        }
        if branches.len() == 1 {
            Ok(branches.pop().expect("single branch"))
        } else {
            Ok(Matcher::Or(branches))
        }
    }

    fn sequence(&mut self) -> Result<Matcher, PatternError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None | Some('|') | Some(')') => break,
                Some('*') | Some('+') | Some('?') => {
                    return Err(PatternError::DanglingModifier)
                }
                _ => {
                    let atom = self.atom()?;
                    items.push(self.quantify(atom)?);
                }
            }
        }
        Ok(Matcher::Seq(items))
    }

    fn atom(&mut self) -> Result<Matcher, PatternError> {
        let c = self.next().expect("sequence checked for end of input");
        match c {
            '.' => Ok(Matcher::Any),
            '^' => Ok(Matcher::Start),
            '$' => Ok(Matcher::End),
            '(' => self.group(),
            '[' => self.char_class().map(Matcher::Class),
            '\\' => self.escape_atom(),
            '{' => {
                if self.quantifier_braces_at(0) {
                    Err(PatternError::DanglingModifier)
                } else {
                    Ok(Matcher::CharSeq("{".to_string()))
                }
            }
            c => Ok(Matcher::CharSeq(c.to_string())),
        }
    }

    /// True when the input at `self.pos + offset` (just past a `{`) looks
    /// like `n}`, `n,}` or `n,m}`.
    fn quantifier_braces_at(&self, offset: usize) -> bool {
        let mut i = offset;
        let mut digits = 0;
        while matches!(self.peek_at(i), Some(c) if c.is_ascii_digit()) {
            i += 1;
            digits += 1;
        }
        if digits == 0 {
            return false;
        }
        if self.peek_at(i) == Some(',') {
            i += 1;
            while matches!(self.peek_at(i), Some(c) if c.is_ascii_digit()) {
                i += 1;
            }
        }
        self.peek_at(i) == Some('}')
    }

    fn quantify(&mut self, atom: Matcher) -> Result<Matcher, PatternError> {
        let quantified = match self.peek() {
            Some('*') => {
                self.pos += 1;
                Matcher::ZeroOrMore(Box::new(atom))
            }
            Some('+') => {
                self.pos += 1;
                Matcher::Repeat {
                    min: 1,
                    max: REPEAT_UNBOUNDED,
                    matcher: Box::new(atom),
                }
            }
            Some('?') => {
                self.pos += 1;
                Matcher::ZeroOrOne(Box::new(atom))
            }
            Some('{') if self.quantifier_braces_at(1) => {
                self.pos += 1;
                let (min, max) = self.braces()?;
                Matcher::Repeat {
                    min,
                    max,
                    matcher: Box::new(atom),
                }
            }
            _ => return Ok(atom),
        };
        match self.peek() {
            Some('?') => Err(PatternError::Unsupported("reluctant quantifier")),
            Some('+') => Err(PatternError::Unsupported("possessive quantifier")),
            _ => Ok(quantified),
        }
    }

    fn braces(&mut self) -> Result<(u32, u32), PatternError> {
        let min = self.number();
        let max = if self.eat(',') {
            if self.peek() == Some('}') {
                REPEAT_UNBOUNDED
            } else {
                self.number()
            }
        } else {
            min
        };
        // Validated by quantifier_braces_at before entry.
        self.eat('}');
        Ok((min, max))
    }

    fn number(&mut self) -> u32 {
        let mut n: u32 = 0;
        while let Some(c) = self.peek() {
            match c.to_digit(10) {
                Some(d) => {
                    n = n.saturating_mul(10).saturating_add(d);
                    self.pos += 1;
                }
                None => break,
            }
        }
        n
    }

    fn group(&mut self) -> Result<Matcher, PatternError> {
        let m = if self.eat('?') {
            match self.next() {
                Some(':') => self.alternation()?,
                Some('=') => Matcher::PosLookahead(Box::new(self.alternation()?)),
                Some('!') => Matcher::NegLookahead(Box::new(self.alternation()?)),
                Some('<') => return Err(PatternError::Unsupported("lookbehind")),
                Some('>') => return Err(PatternError::Unsupported("independent group")),
                Some(c) if c.is_ascii_alphabetic() || c == '-' => {
                    return Err(PatternError::Unsupported("inline flags"))
                }
                _ => return Err(PatternError::UnbalancedParen),
            }
        } else {
            // Capturing groups match like plain groups; the index machinery
            // never extracts submatches.
            self.alternation()?
        };
        if self.eat(')') {
            Ok(m)
        } else {
            Err(PatternError::UnbalancedParen)
        }
    }

    fn escape_atom(&mut self) -> Result<Matcher, PatternError> {
        match self.peek() {
            None => Err(PatternError::DanglingModifier),
            Some('Q') => {
                self.pos += 1;
                self.quotation()
            }
            Some('A') => {
                self.pos += 1;
                Ok(Matcher::Start)
            }
            Some('z') => {
                self.pos += 1;
                Ok(Matcher::End)
            }
            Some('Z') => Err(PatternError::Unsupported("\\Z anchor")),
            Some('b') | Some('B') => Err(PatternError::Unsupported("word boundary")),
            Some('G') => Err(PatternError::Unsupported("\\G anchor")),
            Some('R') => Err(PatternError::Unsupported("linebreak matcher")),
            Some(c) if c.is_ascii_digit() => Err(PatternError::Unsupported("backreference")),
            Some('k') => Err(PatternError::Unsupported("named backreference")),
            _ => self.escape_common().map(|e| match e {
                Escaped::Literal(c) => Matcher::CharSeq(c.to_string()),
                Escaped::Class(class) => Matcher::Class(class),
            }),
        }
    }

    fn quotation(&mut self) -> Result<Matcher, PatternError> {
        let mut literal = String::new();
        loop {
            match self.next() {
                None => return Err(PatternError::UnclosedQuotation),
                Some('\\') if self.peek() == Some('E') => {
                    self.pos += 1;
                    return Ok(Matcher::CharSeq(literal));
                }
                Some(c) => literal.push(c),
            }
        }
    }

    /// Escapes valid both inside and outside a character class.
    fn escape_common(&mut self) -> Result<Escaped, PatternError> {
        let c = match self.next() {
            Some(c) => c,
            None => return Err(PatternError::DanglingModifier),
        };
        let class = |ranges: Vec<(char, char)>| Escaped::Class(CharClass::from_ranges(ranges));
        match c {
            'd' => Ok(class(vec![('0', '9')])),
            'D' => Ok(Escaped::Class(
                CharClass::from_ranges(vec![('0', '9')]).negate(),
            )),
            'w' => Ok(class(word_ranges())),
            'W' => Ok(Escaped::Class(CharClass::from_ranges(word_ranges()).negate())),
            's' => Ok(class(space_ranges())),
            'S' => Ok(Escaped::Class(
                CharClass::from_ranges(space_ranges()).negate(),
            )),
            'h' | 'H' => Err(PatternError::Unsupported("horizontal whitespace class")),
            'v' | 'V' => Err(PatternError::Unsupported("vertical whitespace class")),
            't' => Ok(Escaped::Literal('\t')),
            'n' => Ok(Escaped::Literal('\n')),
            'r' => Ok(Escaped::Literal('\r')),
            'f' => Ok(Escaped::Literal('\x0C')),
            'a' => Ok(Escaped::Literal('\x07')),
            'e' => Ok(Escaped::Literal('\x1B')),
            'c' => Err(PatternError::Unsupported("control escape")),
            'x' => self.hex_escape(2).map(Escaped::Literal),
            'u' => self.hex_escape(4).map(Escaped::Literal),
            'p' => self.property().map(Escaped::Class),
            'P' => self.property().map(|c| Escaped::Class(c.negate())),
            c => Ok(Escaped::Literal(c)),
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, PatternError> {
        let mut value: u32 = 0;
        for _ in 0..digits {
            let d = self
                .next()
                .and_then(|c| c.to_digit(16))
                .ok_or(PatternError::Unsupported("malformed hex escape"))?;
            value = value * 16 + d;
        }
        char::from_u32(value).ok_or(PatternError::Unsupported("hex escape out of range"))
    }

    fn property(&mut self) -> Result<CharClass, PatternError> {
        let name = if self.eat('{') {
            let mut name = String::new();
            loop {
                match self.next() {
                    None => return Err(PatternError::UnknownCharProperty(name)),
                    Some('}') => break,
                    Some(c) => name.push(c),
                }
            }
            name
        } else {
            match self.next() {
                Some(c) => c.to_string(),
                None => return Err(PatternError::UnknownCharProperty(String::new())),
            }
        };
        property_class(&name).ok_or(PatternError::UnknownCharProperty(name))
    }

    fn char_class(&mut self) -> Result<CharClass, PatternError> {
        let negated = self.eat('^');
        let mut class = CharClass::from_ranges(Vec::new());
        let mut first = true;
        loop {
            match self.peek() {
                None => return Err(PatternError::UnclosedCharClass),
                Some(']') if !first => {
                    self.pos += 1;
                    break;
                }
                _ => {}
            }
            first = false;
            let item = self.class_item()?;
            match item {
                Escaped::Class(c) => class = class.union(&c),
                Escaped::Literal(lo) => {
                    // A dash makes a range unless it closes the class.
                    if self.peek() == Some('-') && !matches!(self.peek_at(1), Some(']') | None) {
                        self.pos += 1;
                        match self.class_item()? {
                            Escaped::Literal(hi) => {
                                if hi < lo {
                                    return Err(PatternError::Unsupported(
                                        "inverted character range",
                                    ));
                                }
                                class = class.union(&CharClass::from_ranges(vec![(lo, hi)]));
                            }
                            Escaped::Class(_) => {
                                return Err(PatternError::Unsupported(
                                    "class as character range bound",
                                ))
                            }
                        }
                    } else {
                        class = class.union(&CharClass::single(lo));
                    }
                }
            }
        }
        Ok(if negated { class.negate() } else { class })
    }

    fn class_item(&mut self) -> Result<Escaped, PatternError> {
        match self.next() {
            None => Err(PatternError::UnclosedCharClass),
            Some('\\') => match self.peek() {
                Some('Q') => Err(PatternError::Unsupported("quotation in character class")),
                _ => self.escape_common(),
            },
            Some('&') if self.peek() == Some('&') => {
                Err(PatternError::Unsupported("character class intersection"))
            }
            Some(c) => Ok(Escaped::Literal(c)),
        }
    }
}

enum Escaped {
    Literal(char),
    Class(CharClass),
}

fn word_ranges() -> Vec<(char, char)> {
    vec![('0', '9'), ('A', 'Z'), ('_', '_'), ('a', 'z')]
}

fn space_ranges() -> Vec<(char, char)> {
    vec![('\t', '\r'), (' ', ' ')]
}

fn property_class(name: &str) -> Option<CharClass> {
    let ranges = match name {
        "Alpha" => vec![('A', 'Z'), ('a', 'z')],
        "Digit" => vec![('0', '9')],
        "Alnum" => vec![('0', '9'), ('A', 'Z'), ('a', 'z')],
        "Upper" => vec![('A', 'Z')],
        "Lower" => vec![('a', 'z')],
        "Space" => space_ranges(),
        "Blank" => vec![('\t', '\t'), (' ', ' ')],
        "Punct" => vec![('!', '/'), (':', '@'), ('[', '`'), ('{', '~')],
        "Cntrl" => vec![('\0', '\x1F'), ('\x7F', '\x7F')],
        "XDigit" => vec![('0', '9'), ('A', 'F'), ('a', 'f')],
        "Print" => vec![(' ', '~')],
        "Graph" => vec![('!', '~')],
        "ASCII" => vec![('\0', '\x7F')],
        _ => return None,
    };
    Some(CharClass::from_ranges(ranges))
}
