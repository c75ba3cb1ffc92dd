//! Translate literal text into QEMU `sendkey` directives
//!
//! Each character becomes one key token. Characters that need a modifier or
//! have a non-obvious key name go through [`KEY_TABLE`]; everything else
//! (lowercase letters, digits) is already its own key name.
//!
//! A span like `<ret>` names a single key symbolically. Only names made of
//! lowercase letters and underscores are recognized; `<lt>` and `<gt>` type
//! a literal `<` and `>`.

use std::fmt::Display;
use std::sync::OnceLock;

use regex::Regex;

/// Character to key name, for characters that are not their own key name.
const KEY_TABLE: &[(char, &str)] = &[
    (' ', "spc"),
    ('\n', "ret"),
    ('\t', "tab"),
    ('!', "shift-1"),
    ('@', "shift-2"),
    ('#', "shift-3"),
    ('$', "shift-4"),
    ('%', "shift-5"),
    ('^', "shift-6"),
    ('&', "shift-7"),
    ('*', "shift-8"),
    ('(', "shift-9"),
    (')', "shift-0"),
    ('-', "minus"),
    ('_', "shift-minus"),
    ('=', "equal"),
    ('+', "shift-equal"),
    ('[', "bracket_left"),
    (']', "bracket_right"),
    ('{', "shift-bracket_left"),
    ('}', "shift-bracket_right"),
    ('\\', "backslash"),
    ('|', "shift-backslash"),
    (';', "semicolon"),
    (':', "shift-semicolon"),
    ('\'', "apostrophe"),
    ('"', "shift-apostrophe"),
    ('`', "grave_accent"),
    ('~', "shift-grave_accent"),
    (',', "comma"),
    ('<', "shift-comma"),
    ('.', "dot"),
    ('>', "shift-dot"),
    ('/', "slash"),
    ('?', "shift-slash"),
];

/// Uppercase letters are the shifted lowercase key.
const UPPERCASE_KEYS: [&str; 26] = [
    "shift-a", "shift-b", "shift-c", "shift-d", "shift-e", "shift-f", "shift-g", "shift-h",
    "shift-i", "shift-j", "shift-k", "shift-l", "shift-m", "shift-n", "shift-o", "shift-p",
    "shift-q", "shift-r", "shift-s", "shift-t", "shift-u", "shift-v", "shift-w", "shift-x",
    "shift-y", "shift-z",
];

fn symbolic_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Anchored: only ever matched against the text starting at a '<'.
    RE.get_or_init(|| Regex::new(r"^<([a-z_]+)>").expect("valid regex"))
}

/// One key as understood by the monitor's `sendkey` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyToken(String);

impl KeyToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_char(c: char) -> Self {
        if c.is_ascii_uppercase() {
            let idx = (c as u8 - b'A') as usize;
            return Self(UPPERCASE_KEYS[idx].to_owned());
        }
        match KEY_TABLE.iter().find(|(k, _)| *k == c) {
            Some((_, name)) => Self((*name).to_owned()),
            None => Self(c.to_string()),
        }
    }

    fn from_symbolic(name: &str) -> Self {
        match name {
            "lt" => Self::from_char('<'),
            "gt" => Self::from_char('>'),
            other => Self(other.to_owned()),
        }
    }
}

impl Display for KeyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered run of keys to be typed into the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySequence(Vec<KeyToken>);

impl KeySequence {
    pub fn tokens(&self) -> &[KeyToken] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One `sendkey` monitor command per key.
    pub fn monitor_commands(&self) -> Vec<String> {
        self.0.iter().map(|k| format!("sendkey {k}")).collect()
    }
}

/// Compile `literal` into the keys that type it.
pub fn compile(literal: &str) -> KeySequence {
    let re = symbolic_key_re();
    let mut keys = Vec::with_capacity(literal.len());
    let mut rest = literal;
    while let Some(c) = rest.chars().next() {
        if c == '<' {
            if let Some(caps) = re.captures(rest) {
                keys.push(KeyToken::from_symbolic(&caps[1]));
                rest = &rest[caps[0].len()..];
                continue;
            }
        }
        keys.push(KeyToken::from_char(c));
        rest = &rest[c.len_utf8()..];
    }
    KeySequence(keys)
}
