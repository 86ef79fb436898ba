//! Script parser.
//!
//! Scripts are parsed one command at a time so that a syntax error late in
//! a script does not stop earlier commands from running.  Each word is a
//! sequence of [`Part`]s that the interpreter substitutes at run time.

use super::interp::SubstFlags;

/// One piece of a word.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    /// `$name` or `$name(index)`; the index is itself substituted.
    Var {
        name: String,
        index: Option<Vec<Part>>,
    },
    /// `[script]`
    Script(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub parts: Vec<Part>,
    /// Prefixed with `{*}`: the word's value is spliced in as a list.
    pub expand: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub words: Vec<Word>,
    /// Source text of the command, for error traces.
    pub source: String,
    /// Byte offset of the command within its script.
    pub start: usize,
}

pub fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0b' | b'\x0c')
}

fn is_var_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

// ── Backslash sequences ───────────────────────────────────────────────────────

/// Decode the backslash sequence at the start of `src` (which begins with
/// `\`).  Returns the replacement text and the number of bytes consumed.
pub fn backslash(src: &str) -> (String, usize) {
    let rest = &src[1..];
    let Some(c) = rest.chars().next() else {
        return ("\\".to_owned(), 1);
    };
    let single = |ch: char| (ch.to_string(), 1 + c.len_utf8());
    match c {
        'a' => single('\x07'),
        'b' => single('\x08'),
        'f' => single('\x0c'),
        'n' => single('\n'),
        'r' => single('\r'),
        't' => single('\t'),
        'v' => single('\x0b'),
        'x' => match hex_prefix(&rest[1..], 2) {
            (0, _) => single('x'),
            (n, v) => (char_of(v).to_string(), 2 + n),
        },
        'u' => match hex_prefix(&rest[1..], 4) {
            (0, _) => single('u'),
            (n, v) => (char_of(v).to_string(), 2 + n),
        },
        '0'..='7' => {
            let digits: String = rest.chars().take(3).take_while(|d| d.is_digit(8)).collect();
            let v = u32::from_str_radix(&digits, 8).unwrap_or(0) & 0xff;
            (char_of(v).to_string(), 1 + digits.len())
        }
        '\n' => {
            let ws = rest[1..]
                .bytes()
                .take_while(|b| matches!(b, b' ' | b'\t'))
                .count();
            (" ".to_owned(), 2 + ws)
        }
        other => single(other),
    }
}

fn hex_prefix(s: &str, max: usize) -> (usize, u32) {
    let digits: String = s.chars().take(max).take_while(|c| c.is_ascii_hexdigit()).collect();
    let v = u32::from_str_radix(&digits, 16).unwrap_or(0);
    (digits.len(), v)
}

fn char_of(v: u32) -> char {
    char::from_u32(v).unwrap_or('\u{fffd}')
}

// ── Parser ────────────────────────────────────────────────────────────────────

pub struct Parser<'a> {
    src: &'a str,
    pos: usize,
    /// Inside `[...]`: a `]` ends the script.
    nested: bool,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Self {
        Parser {
            src,
            pos: 0,
            nested: false,
        }
    }

    /// Parser positioned at `pos`, for callers scanning embedded syntax.
    pub fn at(src: &'a str, pos: usize) -> Self {
        Parser {
            src,
            pos,
            nested: false,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.as_bytes().get(self.pos + offset).copied()
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn at_command_end(&self) -> bool {
        match self.peek() {
            None | Some(b'\n' | b';') => true,
            Some(b']') => self.nested,
            _ => false,
        }
    }

    fn push_char(&mut self, buf: &mut String) {
        if let Some(ch) = self.rest().chars().next() {
            buf.push(ch);
            self.pos += ch.len_utf8();
        }
    }

    /// Skip blanks between words, including backslash-newline.
    fn skip_blanks(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\x0b' | b'\x0c') => self.pos += 1,
                Some(b'\\') if self.peek_at(1) == Some(b'\n') => {
                    self.pos += backslash(self.rest()).1;
                }
                _ => return,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b'\\' => self.pos += 2,
                b'\n' => {
                    self.pos += 1;
                    return;
                }
                _ => self.pos += 1,
            }
        }
        self.pos = self.pos.min(self.src.len());
    }

    /// Next non-empty command, or `None` at the end of the script (or at
    /// the closing `]` of a nested script, which is left unconsumed).
    pub fn next_command(&mut self) -> Result<Option<ParsedCommand>, String> {
        loop {
            // Between commands.
            loop {
                match self.peek() {
                    Some(b';' | b'\n') => self.pos += 1,
                    Some(b) if is_space(b) => self.pos += 1,
                    Some(b'\\') if self.peek_at(1) == Some(b'\n') => {
                        self.pos += backslash(self.rest()).1;
                    }
                    Some(b'#') => self.skip_comment(),
                    _ => break,
                }
            }
            if self.at_end() || (self.nested && self.peek() == Some(b']')) {
                return Ok(None);
            }

            let start = self.pos;
            let mut words = Vec::new();
            loop {
                self.skip_blanks();
                if self.at_command_end() {
                    break;
                }
                words.push(self.word()?);
            }
            let source = self.src[start..self.pos].trim_end().to_owned();
            if !words.is_empty() {
                return Ok(Some(ParsedCommand { words, source, start }));
            }
        }
    }

    fn word(&mut self) -> Result<Word, String> {
        let mut expand = false;
        if self.rest().starts_with("{*}")
            && self
                .peek_at(3)
                .is_some_and(|b| !is_space(b) && b != b';' && !(self.nested && b == b']'))
        {
            expand = true;
            self.pos += 3;
        }
        let parts = match self.peek() {
            Some(b'{') => {
                let text = self.braced()?;
                self.check_word_end("close-brace")?;
                vec![Part::Text(text)]
            }
            Some(b'"') => {
                let parts = self.quoted()?;
                self.check_word_end("close-quote")?;
                parts
            }
            _ => self.bare()?,
        };
        Ok(Word { parts, expand })
    }

    fn check_word_end(&self, what: &str) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(b) if is_space(b) || b == b';' => Ok(()),
            Some(b']') if self.nested => Ok(()),
            Some(b'\\') if self.peek_at(1) == Some(b'\n') => Ok(()),
            Some(_) => Err(format!("extra characters after {what}")),
        }
    }

    /// `{...}` with the opening brace at the cursor.  Contents are literal
    /// except that backslash-newline-whitespace collapses to a space.
    pub fn braced(&mut self) -> Result<String, String> {
        self.pos += 1;
        let mut depth = 1;
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err("missing close-brace".into()),
                Some(b'{') => {
                    depth += 1;
                    text.push('{');
                    self.pos += 1;
                }
                Some(b'}') => {
                    depth -= 1;
                    self.pos += 1;
                    if depth == 0 {
                        return Ok(text);
                    }
                    text.push('}');
                }
                Some(b'\\') if self.peek_at(1) == Some(b'\n') => {
                    let (s, n) = backslash(self.rest());
                    text.push_str(&s);
                    self.pos += n;
                }
                Some(b'\\') => {
                    text.push('\\');
                    self.pos += 1;
                    self.push_char(&mut text);
                }
                Some(_) => self.push_char(&mut text),
            }
        }
    }

    /// `"..."` with the opening quote at the cursor.
    pub fn quoted(&mut self) -> Result<Vec<Part>, String> {
        self.pos += 1;
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err("missing \"".into()),
                Some(b'"') => {
                    self.pos += 1;
                    flush(&mut parts, &mut text);
                    return Ok(parts);
                }
                _ => self.substitution(&mut parts, &mut text, SubstFlags::ALL)?,
            }
        }
    }

    fn bare(&mut self) -> Result<Vec<Part>, String> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => break,
                Some(b) if is_space(b) || b == b';' => break,
                Some(b']') if self.nested => break,
                _ => self.substitution(&mut parts, &mut text, SubstFlags::ALL)?,
            }
        }
        flush(&mut parts, &mut text);
        Ok(parts)
    }

    /// Consume one unit of substitutable text: a variable, a command, a
    /// backslash sequence, or a plain character.
    fn substitution(
        &mut self,
        parts: &mut Vec<Part>,
        text: &mut String,
        flags: SubstFlags,
    ) -> Result<(), String> {
        match self.peek() {
            Some(b'$') if flags.contains(SubstFlags::VARIABLES) => match self.variable()? {
                Some(var) => {
                    flush(parts, text);
                    parts.push(var);
                }
                None => text.push('$'),
            },
            Some(b'[') if flags.contains(SubstFlags::COMMANDS) => {
                let script = self.command_substitution()?;
                flush(parts, text);
                parts.push(Part::Script(script));
            }
            Some(b'\\') if flags.contains(SubstFlags::BACKSLASHES) => {
                let (s, n) = backslash(self.rest());
                text.push_str(&s);
                self.pos += n;
            }
            _ => self.push_char(text),
        }
        Ok(())
    }

    /// `$...` with the dollar sign at the cursor.  Returns `None` (and
    /// consumes just the `$`) when no variable name follows.
    pub fn variable(&mut self) -> Result<Option<Part>, String> {
        self.pos += 1;
        if self.peek() == Some(b'{') {
            let start = self.pos + 1;
            match self.src[start..].find('}') {
                Some(len) => {
                    self.pos = start + len + 1;
                    return Ok(Some(Part::Var {
                        name: self.src[start..start + len].to_owned(),
                        index: None,
                    }));
                }
                None => return Err("missing close-brace for variable name".into()),
            }
        }

        let start = self.pos;
        loop {
            match self.peek() {
                Some(b) if is_var_char(b) => self.pos += 1,
                Some(b':') if self.peek_at(1) == Some(b':') => self.pos += 2,
                _ => break,
            }
        }
        let name = self.src[start..self.pos].to_owned();
        if name.is_empty() {
            return Ok(None);
        }

        let index = if self.peek() == Some(b'(') {
            self.pos += 1;
            let mut parts = Vec::new();
            let mut text = String::new();
            loop {
                match self.peek() {
                    None => return Err("missing )".into()),
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => self.substitution(&mut parts, &mut text, SubstFlags::ALL)?,
                }
            }
            flush(&mut parts, &mut text);
            Some(parts)
        } else {
            None
        };
        Ok(Some(Part::Var { name, index }))
    }

    /// `[...]` with the bracket at the cursor; returns the inner script.
    pub fn command_substitution(&mut self) -> Result<String, String> {
        let start = self.pos + 1;
        let mut inner = Parser {
            src: self.src,
            pos: start,
            nested: true,
        };
        while inner.next_command()?.is_some() {}
        if inner.peek() != Some(b']') {
            return Err("missing close-bracket".into());
        }
        self.pos = inner.pos + 1;
        Ok(self.src[start..inner.pos].to_owned())
    }
}

fn flush(parts: &mut Vec<Part>, text: &mut String) {
    if !text.is_empty() {
        parts.push(Part::Text(std::mem::take(text)));
    }
}

/// Split a `subst` template into parts, honouring which substitutions are
/// enabled.
pub fn template(src: &str, flags: SubstFlags) -> Result<Vec<Part>, String> {
    let mut parser = Parser::new(src);
    let mut parts = Vec::new();
    let mut text = String::new();
    while !parser.at_end() {
        parser.substitution(&mut parts, &mut text, flags)?;
    }
    flush(&mut parts, &mut text);
    Ok(parts)
}

/// False when `src` ends inside an open brace, quote or bracket, i.e. more
/// input could still complete it.
pub fn is_complete(src: &str) -> bool {
    let mut parser = Parser::new(src);
    loop {
        match parser.next_command() {
            Ok(Some(_)) => {}
            Ok(None) => return true,
            Err(message) => return !message.starts_with("missing"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(src: &str) -> Vec<ParsedCommand> {
        let mut p = Parser::new(src);
        let mut out = Vec::new();
        while let Some(cmd) = p.next_command().expect("parse failed") {
            out.push(cmd);
        }
        out
    }

    fn text(s: &str) -> Part {
        Part::Text(s.into())
    }

    #[test]
    fn splits_commands_and_skips_comments() {
        let cmds = commands("set a 1; set b 2\n# comment ; still comment\nputs $a\n");
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0].source, "set a 1");
        assert_eq!(cmds[2].words[1].parts, vec![Part::Var { name: "a".into(), index: None }]);
    }

    #[test]
    fn braces_are_literal() {
        let cmds = commands("if {$x} {puts [a]}");
        assert_eq!(cmds[0].words[1].parts, vec![text("$x")]);
        assert_eq!(cmds[0].words[2].parts, vec![text("puts [a]")]);
    }

    #[test]
    fn quoted_word_substitutes() {
        let cmds = commands("puts \"a $b(c$d) [e f]\\t\"");
        assert_eq!(
            cmds[0].words[1].parts,
            vec![
                text("a "),
                Part::Var {
                    name: "b".into(),
                    index: Some(vec![text("c"), Part::Var { name: "d".into(), index: None }]),
                },
                text(" "),
                Part::Script("e f".into()),
                text("\t"),
            ]
        );
    }

    #[test]
    fn nested_brackets() {
        let cmds = commands("set x [list [a] {]}]");
        assert_eq!(cmds[0].words[2].parts, vec![Part::Script("list [a] {]}".into())]);
    }

    #[test]
    fn expansion_prefix() {
        let cmds = commands("list {*}$xs {*}");
        assert!(cmds[0].words[1].expand);
        assert!(!cmds[0].words[2].expand);
        assert_eq!(cmds[0].words[2].parts, vec![text("*")]);
    }

    #[test]
    fn dollar_without_name_is_literal() {
        let cmds = commands("puts $ a$");
        assert_eq!(cmds[0].words[1].parts, vec![text("$")]);
        assert_eq!(cmds[0].words[2].parts, vec![text("a$")]);
    }

    #[test]
    fn syntax_errors() {
        let err = |src: &str| {
            let mut p = Parser::new(src);
            loop {
                match p.next_command() {
                    Ok(Some(_)) => continue,
                    Ok(None) => panic!("no error for {src:?}"),
                    Err(e) => return e,
                }
            }
        };
        assert_eq!(err("set a {b"), "missing close-brace");
        assert_eq!(err("set a \"b"), "missing \"");
        assert_eq!(err("set a [b"), "missing close-bracket");
        assert!(!is_complete("proc f {} {\n"));
        assert!(!is_complete("puts \"abc"));
        assert!(is_complete("set a {b}; puts $a\n"));
        assert_eq!(err("set a {b}c"), "extra characters after close-brace");
        assert_eq!(err("set a \"b\"c"), "extra characters after close-quote");
        assert_eq!(err("puts ${a"), "missing close-brace for variable name");
        assert_eq!(err("puts $a(b"), "missing )");
    }

    #[test]
    fn backslash_sequences() {
        assert_eq!(backslash("\\n"), ("\n".into(), 2));
        assert_eq!(backslash("\\x41z"), ("A".into(), 4));
        assert_eq!(backslash("\\u00e9"), ("é".into(), 6));
        assert_eq!(backslash("\\101"), ("A".into(), 4));
        assert_eq!(backslash("\\\n   x"), (" ".into(), 5));
        assert_eq!(backslash("\\q"), ("q".into(), 2));
        assert_eq!(backslash("\\"), ("\\".into(), 1));
    }

    #[test]
    fn template_respects_flags() {
        let parts = template("$a [b] \\n", SubstFlags::VARIABLES).unwrap();
        assert_eq!(
            parts,
            vec![Part::Var { name: "a".into(), index: None }, text(" [b] \\n")]
        );
    }
}
