//! grub2 config parser: a subset of the grub2 scripting language
//! (`grub.cfg`/`grub2.cfg`) sufficient to extract boot options.
//!
//! Covers variable assignment and expansion (including the greedy
//! multi-digit positional-parameter form grub2 uses, `$10` being the
//! tenth positional argument rather than `$1` followed by a literal
//! `"0"`), `if`/`while`/`for`, `function` definitions, `menuentry` and
//! `submenu`, `linux`/`linuxefi`, `initrd`/`initrdefi`, `source`
//! (depth-capped like syslinux's `INCLUDE`), `search`, `load_env`/
//! `save_env` against the grubenv fixed-size text format, `blscfg`
//! (BLS fragments under `/loader/entries`), and `test`/`[`.
//!
//! Command substitution and here-documents never appear in the corpus
//! this was built against and aren't implemented; backtick-quoted text
//! is treated as a literal.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use crate::model::BootOption;
use crate::registry::DeviceHandle;
use crate::resource::{Resource, Selector};

use super::{DiscoverContext, ParseResult};
use crate::error::Result;
use crate::registry::Registry;

const SEARCH_PATHS: &[&str] = &[
    "/grub/grub.cfg",
    "/grub2/grub.cfg",
    "/boot/grub/grub.cfg",
    "/boot/grub2/grub.cfg",
    "/efi/boot/grub.cfg",
    "/EFI/BOOT/grub.cfg",
];

const MAX_SOURCE_DEPTH: u32 = 10;

// ---------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------

#[derive(Clone)]
enum WordPart {
    /// Unquoted or double-quoted text: expanded for `$var`/`${var}`.
    Raw(String),
    /// Single-quoted text: never expanded.
    Literal(String),
}

type Word = Vec<WordPart>;

enum Tok {
    Word(Word),
    Semi,
    Newline,
    LBrace,
    RBrace,
}

fn tokenize(input: &str) -> Vec<Tok> {
    let chars: Vec<char> = input.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    let mut cur: Word = Vec::new();
    let mut cur_raw = String::new();

    macro_rules! flush_raw {
        () => {
            if !cur_raw.is_empty() {
                cur.push(WordPart::Raw(std::mem::take(&mut cur_raw)));
            }
        };
    }
    macro_rules! flush_word {
        () => {
            flush_raw!();
            if !cur.is_empty() {
                toks.push(Tok::Word(std::mem::take(&mut cur)));
            }
        };
    }

    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' if cur.is_empty() && cur_raw.is_empty() => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ' ' | '\t' | '\r' => {
                flush_word!();
                i += 1;
            }
            '\n' => {
                flush_word!();
                toks.push(Tok::Newline);
                i += 1;
            }
            ';' => {
                flush_word!();
                toks.push(Tok::Semi);
                i += 1;
            }
            '{' => {
                flush_word!();
                toks.push(Tok::LBrace);
                i += 1;
            }
            '}' => {
                flush_word!();
                toks.push(Tok::RBrace);
                i += 1;
            }
            '\'' => {
                flush_raw!();
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '\'' {
                    i += 1;
                }
                let lit: String = chars[start..i].iter().collect();
                cur.push(WordPart::Literal(lit));
                if i < chars.len() {
                    i += 1;
                }
            }
            '"' => {
                i += 1;
                let mut buf = String::new();
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        buf.push(chars[i + 1]);
                        i += 2;
                    } else {
                        buf.push(chars[i]);
                        i += 1;
                    }
                }
                if i < chars.len() {
                    i += 1;
                }
                cur_raw.push_str(&buf);
            }
            '`' => {
                // Command substitution is unused in practice; treat as literal text.
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '`' {
                    i += 1;
                }
                cur_raw.push_str(&chars[start..i].iter().collect::<String>());
                if i < chars.len() {
                    i += 1;
                }
            }
            '\\' if i + 1 < chars.len() => {
                cur_raw.push(chars[i + 1]);
                i += 2;
            }
            _ => {
                cur_raw.push(c);
                i += 1;
            }
        }
    }
    flush_word!();
    toks
}

fn word_raw(word: &Word) -> String {
    word.iter()
        .map(|p| match p {
            WordPart::Raw(s) | WordPart::Literal(s) => s.as_str(),
        })
        .collect::<Vec<_>>()
        .concat()
}

/// `name=value` assignment, recognized only for single-word statements
/// (and reused by `set`, whose single argument has the same shape).
fn try_split_assignment(word: &Word) -> Option<(String, Word)> {
    let first = word.first()?;
    let WordPart::Raw(s) = first else { return None };
    let eq = s.find('=')?;
    let name = &s[..eq];
    let mut chars = name.chars();
    let first_ch = chars.next()?;
    if !(first_ch.is_ascii_alphabetic() || first_ch == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let tail = &s[eq + 1..];
    let mut value: Word = Vec::new();
    if !tail.is_empty() {
        value.push(WordPart::Raw(tail.to_string()));
    }
    value.extend(word[1..].iter().cloned());
    Some((name.to_string(), value))
}

// ---------------------------------------------------------------------
// Statement parser
// ---------------------------------------------------------------------

enum Stmt {
    Assign(String, Word),
    Command(Word, Vec<Word>),
    If {
        cond: Vec<Stmt>,
        then_block: Vec<Stmt>,
        else_block: Option<Vec<Stmt>>,
    },
    While {
        cond: Vec<Stmt>,
        body: Vec<Stmt>,
    },
    For {
        var: String,
        items: Vec<Word>,
        body: Vec<Stmt>,
    },
    FunctionDef(String, Rc<Vec<Stmt>>),
    Menuentry {
        args: Vec<Word>,
        body: Vec<Stmt>,
    },
    Submenu {
        args: Vec<Word>,
        body: Vec<Stmt>,
    },
}

struct TokStream<'a> {
    toks: &'a [Tok],
    pos: usize,
}

impl<'a> TokStream<'a> {
    fn new(toks: &'a [Tok]) -> Self {
        Self { toks, pos: 0 }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn skip_seps(&mut self) {
        while matches!(self.peek(), Some(Tok::Semi) | Some(Tok::Newline)) {
            self.pos += 1;
        }
    }

    fn peek_is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Word(w)) if word_raw(w) == kw)
    }

    fn next_word(&mut self) -> Option<Word> {
        if let Some(Tok::Word(w)) = self.peek() {
            let w = w.clone();
            self.pos += 1;
            Some(w)
        } else {
            None
        }
    }

    /// Parse statements until a listed keyword or (if requested) a `}`
    /// appears as the next token, without consuming the terminator.
    fn parse_stmt_list(&mut self, stop_kw: &[&str], stop_on_rbrace: bool) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            self.skip_seps();
            if self.at_end() {
                break;
            }
            if stop_on_rbrace && matches!(self.peek(), Some(Tok::RBrace)) {
                break;
            }
            if let Some(Tok::Word(w)) = self.peek() {
                if stop_kw.contains(&word_raw(w).as_str()) {
                    break;
                }
            }
            match self.parse_one_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => {
                    if !self.at_end() {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
        }
        stmts
    }

    fn parse_one_stmt(&mut self) -> Option<Stmt> {
        self.skip_seps();
        match self.peek()? {
            Tok::Word(w) => {
                let kw = word_raw(w);
                match kw.as_str() {
                    "if" => {
                        self.pos += 1;
                        Some(self.parse_if())
                    }
                    "while" => {
                        self.pos += 1;
                        Some(self.parse_while())
                    }
                    "for" => {
                        self.pos += 1;
                        Some(self.parse_for())
                    }
                    "function" => {
                        self.pos += 1;
                        Some(self.parse_function())
                    }
                    "menuentry" => {
                        self.pos += 1;
                        Some(self.parse_menuentry_like(false))
                    }
                    "submenu" => {
                        self.pos += 1;
                        Some(self.parse_menuentry_like(true))
                    }
                    _ => Some(self.parse_simple_stmt()),
                }
            }
            _ => None,
        }
    }

    fn parse_simple_stmt(&mut self) -> Stmt {
        let mut words = Vec::new();
        while let Some(w) = self.next_word() {
            words.push(w);
        }
        if words.len() == 1 {
            if let Some((name, value)) = try_split_assignment(&words[0]) {
                return Stmt::Assign(name, value);
            }
        }
        let mut it = words.into_iter();
        let name = it.next().unwrap_or_default();
        Stmt::Command(name, it.collect())
    }

    fn parse_if(&mut self) -> Stmt {
        let cond = self.parse_stmt_list(&["then"], false);
        self.skip_seps();
        if self.peek_is_keyword("then") {
            self.pos += 1;
        }
        let then_block = self.parse_stmt_list(&["else", "fi"], false);
        self.skip_seps();
        let else_block = if self.peek_is_keyword("else") {
            self.pos += 1;
            let b = self.parse_stmt_list(&["fi"], false);
            self.skip_seps();
            if self.peek_is_keyword("fi") {
                self.pos += 1;
            }
            Some(b)
        } else {
            if self.peek_is_keyword("fi") {
                self.pos += 1;
            }
            None
        };
        Stmt::If { cond, then_block, else_block }
    }

    fn parse_while(&mut self) -> Stmt {
        let cond = self.parse_stmt_list(&["do"], false);
        self.skip_seps();
        if self.peek_is_keyword("do") {
            self.pos += 1;
        }
        let body = self.parse_stmt_list(&["done"], false);
        self.skip_seps();
        if self.peek_is_keyword("done") {
            self.pos += 1;
        }
        Stmt::While { cond, body }
    }

    fn parse_for(&mut self) -> Stmt {
        self.skip_seps();
        let var = self.next_word().map(|w| word_raw(&w)).unwrap_or_default();
        self.skip_seps();
        if self.peek_is_keyword("in") {
            self.pos += 1;
        }
        let mut items = Vec::new();
        loop {
            self.skip_seps();
            if self.peek_is_keyword("do") {
                self.pos += 1;
                break;
            }
            if self.at_end() {
                break;
            }
            match self.next_word() {
                Some(w) => items.push(w),
                None => break,
            }
        }
        let body = self.parse_stmt_list(&["done"], false);
        self.skip_seps();
        if self.peek_is_keyword("done") {
            self.pos += 1;
        }
        Stmt::For { var, items, body }
    }

    fn parse_function(&mut self) -> Stmt {
        self.skip_seps();
        let name = self.next_word().map(|w| word_raw(&w)).unwrap_or_default();
        self.skip_seps();
        if matches!(self.peek(), Some(Tok::LBrace)) {
            self.pos += 1;
        }
        let body = self.parse_stmt_list(&[], true);
        if matches!(self.peek(), Some(Tok::RBrace)) {
            self.pos += 1;
        }
        Stmt::FunctionDef(name, Rc::new(body))
    }

    fn parse_menuentry_like(&mut self, is_submenu: bool) -> Stmt {
        let mut args = Vec::new();
        while matches!(self.peek(), Some(Tok::Word(_))) {
            if let Some(w) = self.next_word() {
                args.push(w);
            }
        }
        self.skip_seps();
        if matches!(self.peek(), Some(Tok::LBrace)) {
            self.pos += 1;
        }
        let body = self.parse_stmt_list(&[], true);
        if matches!(self.peek(), Some(Tok::RBrace)) {
            self.pos += 1;
        }
        if is_submenu {
            Stmt::Submenu { args, body }
        } else {
            Stmt::Menuentry { args, body }
        }
    }
}

fn parse_stmts(toks: &[Tok]) -> Vec<Stmt> {
    let mut stream = TokStream::new(toks);
    stream.parse_stmt_list(&[], false)
}

// ---------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------

#[derive(Default)]
struct Pending {
    image: Option<Resource>,
    initrd: Option<Resource>,
    dtb: Option<Resource>,
    args: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SearchType {
    Uuid,
    Label,
}

struct Grub2State<'a> {
    ctx: &'a DiscoverContext,
    registry: &'a Registry,
    device_id: String,
    prefix: String,
    env: HashMap<String, String>,
    functions: HashMap<String, Rc<Vec<Stmt>>>,
    pos_stack: Vec<Vec<String>>,
    pending: Pending,
    options: Vec<BootOption>,
    entry_ids: Vec<Option<String>>,
    source_depth: u32,
}

impl<'a> Grub2State<'a> {
    fn new(ctx: &'a DiscoverContext, registry: &'a Registry, device_id: String, prefix: String) -> Self {
        let mut env = HashMap::new();
        env.insert("menuentry_id_option".to_string(), "--id".to_string());
        env.insert("prefix".to_string(), prefix.clone());
        Self {
            ctx,
            registry,
            device_id,
            prefix,
            env,
            functions: HashMap::new(),
            pos_stack: Vec::new(),
            pending: Pending::default(),
            options: Vec::new(),
            entry_ids: Vec::new(),
            source_depth: 0,
        }
    }

    // -- expansion ------------------------------------------------------

    fn expand_word(&self, word: &Word) -> String {
        let mut out = String::new();
        for part in word {
            match part {
                WordPart::Literal(s) => out.push_str(s),
                WordPart::Raw(s) => out.push_str(&self.expand_str(s)),
            }
        }
        out
    }

    /// Expand `$var`/`${var}` references in plain text, used both for
    /// `Raw` word parts and for BLS fragment field values.
    fn expand_str(&self, s: &str) -> String {
        let chars: Vec<char> = s.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '$' && i + 1 < chars.len() {
                if chars[i + 1] == '{' {
                    let mut j = i + 2;
                    while j < chars.len() && chars[j] != '}' {
                        j += 1;
                    }
                    let name: String = chars[i + 2..j].iter().collect();
                    out.push_str(&self.lookup_var(&name));
                    i = if j < chars.len() { j + 1 } else { j };
                    continue;
                } else if chars[i + 1].is_ascii_digit() {
                    // Greedy: `$10` is the tenth positional parameter, not
                    // `$1` followed by a literal `0`.
                    let mut j = i + 1;
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        j += 1;
                    }
                    let digits: String = chars[i + 1..j].iter().collect();
                    out.push_str(&self.lookup_var(&digits));
                    i = j;
                    continue;
                } else if chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_' {
                    let mut j = i + 1;
                    while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                        j += 1;
                    }
                    let name: String = chars[i + 1..j].iter().collect();
                    out.push_str(&self.lookup_var(&name));
                    i = j;
                    continue;
                }
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }

    fn lookup_var(&self, name: &str) -> String {
        if let Ok(idx) = name.parse::<usize>() {
            if idx == 0 {
                return String::new();
            }
            return self
                .pos_stack
                .last()
                .and_then(|p| p.get(idx - 1))
                .cloned()
                .unwrap_or_default();
        }
        self.env.get(name).cloned().unwrap_or_default()
    }

    // -- device paths -----------------------------------------------------

    /// `(UUID-or-label)/path` overrides `$root`; a bare path resolves
    /// against `$root` if set, else the current device. An explicit
    /// device string with no closing `)` or no path after it is invalid.
    fn make_path_resource(&self, path: &str) -> Option<Resource> {
        if let Some(rest) = path.strip_prefix('(') {
            let end = rest.find(')')?;
            let inner = &rest[..end];
            let p = &rest[end + 1..];
            if p.is_empty() {
                return None;
            }
            if inner.is_empty() {
                return Some(Resource::local(Some(self.device_id.clone()), p.to_string()));
            }
            return Some(Resource::unresolved_devspec(Selector::UuidOrLabel(inner.to_string()), p.to_string()));
        }
        match self.env.get("root").filter(|r| !r.is_empty()) {
            Some(root) => Some(Resource::unresolved_devspec(Selector::UuidOrLabel(root.clone()), path.to_string())),
            None => Some(Resource::local(Some(self.device_id.clone()), path.to_string())),
        }
    }

    fn resolve_devpath_device(&self, path: &str) -> Option<(DeviceHandle, String)> {
        if let Some(rest) = path.strip_prefix('(') {
            let end = rest.find(')')?;
            let inner = &rest[..end];
            let p = rest[end + 1..].to_string();
            let device = if inner.is_empty() {
                Some(self.ctx.device.clone())
            } else {
                self.registry.lookup_by_uuid(inner).or_else(|| self.registry.lookup_by_label(inner))
            };
            Some((device?, p))
        } else {
            Some((self.ctx.device.clone(), path.to_string()))
        }
    }

    fn resolve_devpath_to_fs(&self, path: &str) -> Option<PathBuf> {
        let (device, inpath) = self.resolve_devpath_device(path)?;
        let mount = device.borrow().mount_point.clone()?;
        Some(mount.join(inpath.trim_start_matches('/')))
    }

    fn read_devpath(&self, path: &str) -> Option<Vec<u8>> {
        let full = self.resolve_devpath_to_fs(path)?;
        std::fs::read(full).ok()
    }

    // -- evaluation -------------------------------------------------------

    fn eval_block(&mut self, block: &[Stmt]) -> bool {
        let mut result = true;
        for stmt in block {
            result = self.eval_stmt(stmt);
        }
        result
    }

    fn eval_stmt(&mut self, stmt: &Stmt) -> bool {
        match stmt {
            Stmt::Assign(name, word) => {
                let val = self.expand_word(word);
                self.env.insert(name.clone(), val);
                true
            }
            Stmt::FunctionDef(name, body) => {
                self.functions.insert(name.clone(), body.clone());
                true
            }
            Stmt::If { cond, then_block, else_block } => {
                if self.eval_block(cond) {
                    self.eval_block(then_block)
                } else if let Some(eb) = else_block {
                    self.eval_block(eb)
                } else {
                    true
                }
            }
            Stmt::While { cond, body } => {
                let mut iterations = 0;
                while self.eval_block(cond) && iterations < 10_000 {
                    self.eval_block(body);
                    iterations += 1;
                }
                true
            }
            Stmt::For { var, items, body } => {
                let expanded: Vec<String> = items.iter().map(|w| self.expand_word(w)).collect();
                for item in expanded {
                    self.env.insert(var.clone(), item);
                    self.eval_block(body);
                }
                true
            }
            Stmt::Menuentry { args, body } => {
                self.run_menuentry(args, body, false);
                true
            }
            Stmt::Submenu { args, body } => {
                self.run_menuentry(args, body, true);
                true
            }
            Stmt::Command(name, args) => self.run_command(name, args),
        }
    }

    fn run_menuentry(&mut self, args: &[Word], body: &[Stmt], is_submenu: bool) {
        if is_submenu {
            // submenu only groups further menuentries; it never produces
            // a boot option of its own.
            self.eval_block(body);
            return;
        }
        let expanded: Vec<String> = args.iter().map(|w| self.expand_word(w)).collect();
        let (title, id) = parse_menuentry_args(&expanded);
        let saved = std::mem::take(&mut self.pending);
        self.eval_block(body);
        let pending = std::mem::replace(&mut self.pending, saved);
        if let Some(image) = pending.image {
            let mut opt = BootOption::new(title, image);
            opt.initrd = pending.initrd;
            opt.dtb = pending.dtb;
            opt.args = pending.args;
            self.push_option(opt, id);
        }
    }

    fn push_option(&mut self, opt: BootOption, id: Option<String>) {
        self.options.push(opt);
        self.entry_ids.push(id);
    }

    fn run_command(&mut self, name_word: &Word, arg_words: &[Word]) -> bool {
        let name = word_raw(name_word);
        match name.as_str() {
            "set" => {
                if let Some(arg) = arg_words.first() {
                    if let Some((k, v)) = try_split_assignment(arg) {
                        let val = self.expand_word(&v);
                        self.env.insert(k, val);
                    }
                }
                true
            }
            "true" => true,
            "false" => false,
            "test" | "[" => {
                let mut expanded: Vec<String> = arg_words.iter().map(|w| self.expand_word(w)).collect();
                if name == "[" && expanded.last().map(|s| s == "]").unwrap_or(false) {
                    expanded.pop();
                }
                self.eval_test_expr(&expanded)
            }
            "linux" | "linuxefi" => {
                if let Some(first) = arg_words.first() {
                    let path = self.expand_word(first);
                    let rest: Vec<String> = arg_words[1..].iter().map(|w| self.expand_word(w)).collect();
                    match self.make_path_resource(&path) {
                        Some(resource) => {
                            self.pending.image = Some(resource);
                            self.pending.args = if rest.is_empty() { None } else { Some(rest.join(" ")) };
                        }
                        None => tracing::debug!(path, "grub2: invalid linux devpath, skipping"),
                    }
                }
                true
            }
            "initrd" | "initrdefi" => {
                if let Some(first) = arg_words.first() {
                    let path = self.expand_word(first);
                    if let Some(resource) = self.make_path_resource(&path) {
                        self.pending.initrd = Some(resource);
                    }
                }
                true
            }
            "source" | "." => {
                self.run_source(arg_words);
                true
            }
            "search" => {
                self.run_search(arg_words);
                true
            }
            "load_env" => {
                self.run_load_env();
                true
            }
            "save_env" => {
                self.run_save_env(arg_words);
                true
            }
            "blscfg" => {
                self.run_blscfg();
                true
            }
            "" => true,
            other => {
                if let Some(body) = self.functions.get(other).cloned() {
                    let params: Vec<String> = arg_words.iter().map(|w| self.expand_word(w)).collect();
                    self.pos_stack.push(params);
                    self.eval_block(&body);
                    self.pos_stack.pop();
                    true
                } else {
                    tracing::debug!(command = other, "grub2: unrecognized command, ignoring");
                    true
                }
            }
        }
    }

    fn run_source(&mut self, arg_words: &[Word]) {
        if self.source_depth >= MAX_SOURCE_DEPTH {
            tracing::debug!("grub2 source depth exceeded, skipping");
            return;
        }
        let Some(first) = arg_words.first() else { return };
        let path = self.expand_word(first);
        let Some(bytes) = self.read_devpath(&path) else { return };
        let text = String::from_utf8_lossy(&bytes).to_string();
        let toks = tokenize(&text);
        let stmts = parse_stmts(&toks);
        self.source_depth += 1;
        self.eval_block(&stmts);
        self.source_depth -= 1;
    }

    fn run_search(&mut self, arg_words: &[Word]) {
        let expanded: Vec<String> = arg_words.iter().map(|w| self.expand_word(w)).collect();
        let mut set_var: Option<String> = None;
        let mut search_type = SearchType::Uuid;
        let mut value: Option<String> = None;
        let mut i = 0;
        while i < expanded.len() {
            let a = &expanded[i];
            if let Some(v) = a.strip_prefix("--set=") {
                set_var = Some(v.to_string());
                i += 1;
            } else if a == "--set" {
                if i + 1 < expanded.len() && !expanded[i + 1].starts_with("--") {
                    set_var = Some(expanded[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            } else if a == "--fs-uuid" {
                search_type = SearchType::Uuid;
                i += 1;
            } else if a == "--label" {
                search_type = SearchType::Label;
                i += 1;
            } else if a == "--no-floppy" {
                i += 1;
            } else if a.starts_with("--") {
                i += 1;
            } else {
                value = Some(a.clone());
                i += 1;
            }
        }
        let Some(value) = value else { return };
        let var = set_var.unwrap_or_else(|| "root".to_string());
        let found = match search_type {
            SearchType::Uuid => self.registry.lookup_by_uuid(&value),
            SearchType::Label => self.registry.lookup_by_label(&value),
        };
        match found {
            Some(dev) => {
                let id = dev.borrow().id.clone();
                self.env.insert(var, id);
            }
            None => {
                if search_type == SearchType::Uuid {
                    self.env.insert(var, value);
                }
                // A label search that fails to match leaves the target
                // variable untouched.
            }
        }
    }

    fn run_load_env(&mut self) {
        let path = format!("{}/grubenv", self.prefix);
        let Some(bytes) = self.read_devpath(&path) else { return };
        let text = String::from_utf8_lossy(&bytes).to_string();
        for (k, v) in parse_grubenv_vars(&text) {
            self.env.insert(k, v);
        }
    }

    fn run_save_env(&mut self, arg_words: &[Word]) {
        let expanded: Vec<String> = arg_words.iter().map(|w| self.expand_word(w)).collect();
        let mut i = 0;
        let file_path = if expanded.first().map(|s| s.as_str()) == Some("-f") {
            let f = expanded.get(1).cloned();
            i = 2;
            f
        } else {
            None
        };
        let target = file_path.unwrap_or_else(|| format!("{}/grubenv", self.prefix));
        for var in &expanded[i.min(expanded.len())..] {
            let value = self.env.get(var).cloned().unwrap_or_default();
            self.save_env_var(&target, var, &value);
        }
    }

    fn save_env_var(&self, path: &str, key: &str, value: &str) {
        let Some((device, inpath)) = self.resolve_devpath_device(path) else { return };
        let full = {
            let Some(mount) = device.borrow().mount_point.clone() else { return };
            mount.join(inpath.trim_start_matches('/'))
        };
        let Ok(bytes) = std::fs::read(&full) else {
            tracing::debug!(path, "save_env target missing");
            return;
        };
        let text = String::from_utf8_lossy(&bytes).to_string();
        const SIG: &str = "# GRUB Environment Block\n";
        let Some(mut body) = text.strip_prefix(SIG).map(str::to_string) else {
            return;
        };
        apply_grubenv_var(&mut body, key, value);
        let new_text = format!("{SIG}{body}");
        let _ = std::fs::write(&full, new_text.as_bytes());
    }

    fn run_blscfg(&mut self) {
        let Some(mount) = self.ctx.device.borrow().mount_point.clone() else { return };
        let dir = mount.join("loader/entries");
        let Ok(read) = std::fs::read_dir(&dir) else { return };
        let mut files: Vec<String> = read
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "conf").unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        // Newest kernel version first, same convention as real grub BLS
        // scanning: filenames sort so a higher version sorts later.
        files.sort_by(|a, b| b.cmp(a));
        for fname in files {
            let Ok(bytes) = std::fs::read(dir.join(&fname)) else { continue };
            let text = String::from_utf8_lossy(&bytes).to_string();
            if let Some(opt) = self.parse_bls_entry(&text) {
                self.push_option(opt, None);
            }
        }
    }

    fn parse_bls_entry(&self, text: &str) -> Option<BootOption> {
        let mut title = None;
        let mut linux_path = None;
        let mut initrd_path = None;
        let mut options_line = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, val)) = line.split_once(' ') else { continue };
            let expanded = self.expand_str(val.trim());
            match key {
                "title" => title = Some(expanded),
                "linux" => linux_path = expanded.split_whitespace().next().map(str::to_string),
                "initrd" => initrd_path = expanded.split_whitespace().next().map(str::to_string),
                "options" => options_line = Some(expanded.split_whitespace().collect::<Vec<_>>().join(" ")),
                _ => {}
            }
        }
        let title = title?;
        let linux_path = linux_path?;
        let image = self.make_path_resource(&linux_path)?;
        let mut opt = BootOption::new(title, image);
        opt.initrd = initrd_path.and_then(|p| self.make_path_resource(&p));
        opt.args = options_line;
        Some(opt)
    }

    fn eval_test_expr(&self, args: &[String]) -> bool {
        if args.is_empty() {
            return false;
        }
        let mut result: Option<bool> = None;
        let mut op: Option<&str> = None;
        let mut i = 0;
        while i < args.len() {
            let mut negate = false;
            while i < args.len() && args[i] == "!" {
                negate = !negate;
                i += 1;
            }
            if i >= args.len() {
                break;
            }
            let (val, consumed) = self.eval_test_atom(&args[i..]);
            let val = if negate { !val } else { val };
            i += consumed.max(1);
            result = Some(match (result, op) {
                (None, _) => val,
                (Some(r), Some("-o")) => r || val,
                (Some(r), _) => r && val,
            });
            if i < args.len() && (args[i] == "-a" || args[i] == "-o") {
                op = Some(if args[i] == "-a" { "-a" } else { "-o" });
                i += 1;
            } else {
                op = None;
            }
        }
        result.unwrap_or(false)
    }

    fn eval_test_atom(&self, args: &[String]) -> (bool, usize) {
        match args[0].as_str() {
            "-f" | "-s" | "-d" => {
                let path = args.get(1).cloned().unwrap_or_default();
                (self.path_predicate(&path, args[0].as_str()), 2.min(args.len()))
            }
            "-n" => {
                let s = args.get(1).cloned().unwrap_or_default();
                (!s.is_empty(), 2.min(args.len()))
            }
            "-z" => {
                let s = args.get(1).cloned().unwrap_or_default();
                (s.is_empty(), 2.min(args.len()))
            }
            _ => {
                if args.len() >= 3 && args[1] == "=" {
                    (args[0] == args[2], 3)
                } else {
                    (!args[0].is_empty(), 1)
                }
            }
        }
    }

    fn path_predicate(&self, path: &str, flag: &str) -> bool {
        let Some(full) = self.resolve_devpath_to_fs(path) else { return false };
        match flag {
            "-f" => full.is_file(),
            "-d" => full.is_dir(),
            "-s" => std::fs::metadata(&full).map(|m| m.len() > 0).unwrap_or(false),
            _ => false,
        }
    }

    fn resolve_default(&self) -> Option<usize> {
        let default = self
            .env
            .get("default")
            .filter(|s| !s.is_empty())
            .or_else(|| self.env.get("saved_entry").filter(|s| !s.is_empty()))?;
        if let Some(idx) = self.entry_ids.iter().position(|id| id.as_deref() == Some(default.as_str())) {
            return Some(idx);
        }
        if let Some(idx) = self.options.iter().position(|o| &o.name == default) {
            return Some(idx);
        }
        if let Ok(idx) = default.parse::<usize>() {
            if idx < self.options.len() {
                return Some(idx);
            }
        }
        None
    }
}

/// `--id`/`--id=ID`/`--class NAME`/... flags plus the title. Any
/// `--flag` without `=` is assumed to take exactly one following
/// argument, which matches every flag this parser cares about.
fn parse_menuentry_args(expanded: &[String]) -> (String, Option<String>) {
    let mut title: Option<String> = None;
    let mut id: Option<String> = None;
    let mut i = 0;
    while i < expanded.len() {
        let a = &expanded[i];
        if title.is_none() && !a.starts_with("--") {
            title = Some(a.clone());
            i += 1;
            continue;
        }
        if let Some(v) = a.strip_prefix("--id=") {
            id = Some(v.to_string());
            i += 1;
            continue;
        }
        if a == "--id" {
            if i + 1 < expanded.len() {
                id = Some(expanded[i + 1].clone());
                i += 2;
                continue;
            }
        }
        if a.starts_with("--") {
            i += 1;
            if i < expanded.len() && !expanded[i].starts_with("--") {
                i += 1;
            }
            continue;
        }
        i += 1;
    }
    (title.unwrap_or_default(), id)
}

/// Parse `key=value` lines out of a grubenv file's body (after its
/// signature line), skipping blank lines and `#`-padding runs.
fn parse_grubenv_vars(text: &str) -> Vec<(String, String)> {
    let body = text
        .strip_prefix("# GRUB Environment Block\n")
        .unwrap_or(text);
    let mut out = Vec::new();
    for line in body.lines() {
        if line.is_empty() || line.chars().all(|c| c == '#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            out.push((k.to_string(), v.to_string()));
        }
    }
    out
}

/// Splice `key=value\n` into `body` in place, preserving its total byte
/// length: replacing an existing entry pads the deficit with trailing
/// `#`s (or trims that many trailing `#`s if the new value is longer,
/// aborting instead if there aren't enough to trim); inserting a new
/// entry consumes a run of `#` padding at least as long as the new
/// entry, and is silently dropped if none is long enough.
fn apply_grubenv_var(body: &mut String, key: &str, value: &str) {
    let target_len = body.len();
    let new_entry = format!("{key}={value}\n");
    let prefix = format!("{key}=");

    let existing = if body.starts_with(&prefix) {
        Some(0)
    } else {
        body.match_indices('\n').find_map(|(idx, _)| {
            let start = idx + 1;
            if body[start..].starts_with(&prefix) {
                Some(start)
            } else {
                None
            }
        })
    };

    if let Some(start) = existing {
        let end = body[start..].find('\n').map(|i| start + i + 1).unwrap_or(body.len());
        let old_len = end - start;
        let diff = new_entry.len() as isize - old_len as isize;
        if diff > 0 {
            let trim_from = body.len().saturating_sub(diff as usize);
            let trailing = &body[trim_from..];
            if trailing.len() < diff as usize || !trailing.chars().all(|c| c == '#') {
                return;
            }
        }
        body.replace_range(start..end, &new_entry);
        let overshoot = body.len() as isize - target_len as isize;
        if overshoot > 0 {
            let cut = body.len() - overshoot as usize;
            body.truncate(cut);
        } else if overshoot < 0 {
            body.push_str(&"#".repeat((-overshoot) as usize));
        }
    } else if let Some(pos) = find_pad_run(body, new_entry.len()) {
        body.replace_range(pos..pos + new_entry.len(), &new_entry);
    }
    // Otherwise there's no room: drop the write, matching the original's
    // fixed-size grubenv block.
}

fn find_pad_run(body: &str, min_len: usize) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'#' {
            let start = i;
            while i < bytes.len() && bytes[i] == b'#' {
                i += 1;
            }
            if i - start >= min_len {
                return Some(start);
            }
        } else {
            i += 1;
        }
    }
    None
}

// ---------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------

pub fn parse(ctx: &mut DiscoverContext, registry: &Registry) -> Result<ParseResult> {
    let device_id = ctx.device.borrow().id.clone();
    let mut contents = None;
    let mut found_path = None;
    for path in SEARCH_PATHS {
        if let Ok(bytes) = ctx.request_file(registry, path) {
            contents = Some(bytes);
            found_path = Some(*path);
            break;
        }
    }
    let (Some(bytes), Some(found_path)) = (contents, found_path) else {
        return Ok(ParseResult::NotApplicable);
    };
    let prefix = found_path.rsplit_once('/').map(|(d, _)| d.to_string()).unwrap_or_default();
    let text = String::from_utf8_lossy(&bytes).to_string();

    let toks = tokenize(&text);
    let stmts = parse_stmts(&toks);

    let mut state = Grub2State::new(ctx, registry, device_id, prefix);
    state.eval_block(&stmts);

    let default_idx = state.resolve_default();
    let mut options = state.options;
    if options.is_empty() {
        return Ok(ParseResult::ApplicableButEmpty);
    }
    match default_idx {
        Some(idx) => options[idx].is_default = true,
        None => options[0].is_default = true,
    }

    let found = options.len();
    for opt in options {
        ctx.add_boot_option(opt);
    }
    Ok(ParseResult::Found(found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classification, Device};
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn mounted_device(dir: &std::path::Path) -> crate::registry::DeviceHandle {
        let mut d = Device::new("dev0", Classification::Disk);
        d.mount_point = Some(dir.to_path_buf());
        StdRc::new(StdRefCell::new(d))
    }

    fn run(registry: &Registry, device: crate::registry::DeviceHandle) -> (ParseResult, usize) {
        let mut chain = super::super::ParserChain::new();
        chain.register(super::super::Parser::new("grub2", 80, parse));
        super::super::run_default_chain(&chain, DiscoverContext::new(device), registry).unwrap()
    }

    #[test]
    fn single_menuentry_with_args_and_initrd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("grub")).unwrap();
        std::fs::write(
            dir.path().join("grub/grub.cfg"),
            "menuentry 'test' {\n\
             linux /vmlinux arg1=value1 arg2\n\
             initrd /initrd\n\
             }\n",
        )
        .unwrap();

        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, published) = run(&registry, device.clone());
        assert_eq!(result, ParseResult::Found(1));
        assert_eq!(published, 1);
        let d = device.borrow();
        let opt = &d.options()[0];
        assert_eq!(opt.name, "test");
        assert_eq!(opt.args.as_deref(), Some("arg1=value1 arg2"));
        assert!(opt.is_default);
    }

    #[test]
    fn default_selects_by_multiword_label() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "set default=\"Multiple word option\"\n\
             menuentry 'Single word' {\n linux /vmlinux\n }\n\
             menuentry 'Multiple word option' {\n linux /vmlinux2\n }\n",
        )
        .unwrap();

        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, _) = run(&registry, device.clone());
        assert_eq!(result, ParseResult::Found(2));
        let d = device.borrow();
        assert!(!d.options()[0].is_default);
        assert!(d.options()[1].is_default);
    }

    #[test]
    fn default_selects_by_numeric_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "set default=1\n\
             menuentry 'a' {\n linux /a\n }\n\
             menuentry 'b' {\n linux /b\n }\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (_, _) = run(&registry, device.clone());
        let d = device.borrow();
        assert!(d.options()[1].is_default);
    }

    #[test]
    fn if_then_else_selects_branch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "if true; then\n\
             menuentry 'yes' {\n linux /a\n }\n\
             else\n\
             menuentry 'no' {\n linux /b\n }\n\
             fi\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, _) = run(&registry, device.clone());
        assert_eq!(result, ParseResult::Found(1));
        assert_eq!(device.borrow().options()[0].name, "yes");
    }

    #[test]
    fn function_called_with_positional_params_across_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("inner.cfg"),
            "function mkentry {\n\
             menuentry \"$1\" {\n linux \"$2\"\n }\n\
             }\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "source /inner.cfg\n\
             mkentry sourced /vmlinux\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, _) = run(&registry, device.clone());
        assert_eq!(result, ParseResult::Found(1));
        assert_eq!(device.borrow().options()[0].name, "sourced");
    }

    #[test]
    fn bare_devpath_follows_root_variable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "root=00000000-0000-0000-0000-000000000002\n\
             menuentry 'remote' {\n linux /vmlinux\n }\n",
        )
        .unwrap();
        let mut registry = Registry::new();
        let mut other = Device::new("dev1", Classification::Disk);
        other.uuid = Some("00000000-0000-0000-0000-000000000002".to_string());
        other.mount_point = Some(dir.path().to_path_buf());
        registry.add(StdRc::new(StdRefCell::new(other)));

        let device = mounted_device(dir.path());
        let (_, published) = run(&registry, device.clone());
        assert_eq!(published, 1);
        let d = device.borrow();
        assert!(d.options()[0].boot_image.is_resolved());
    }

    #[test]
    fn search_by_uuid_falls_back_to_literal_value_when_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "search --set=v1 --fs-uuid 92b0da57-0000-0000-0000-000000000000\n\
             menuentry \"$v1\" {\n linux /vmlinux\n }\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (_, _) = run(&registry, device.clone());
        assert_eq!(device.borrow().options()[0].name, "92b0da57-0000-0000-0000-000000000000");
    }

    #[test]
    fn search_by_label_leaves_variable_unchanged_when_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "v2=prev\n\
             search --set=v2 --label nosuchlabel\n\
             menuentry \"$v2\" {\n linux /vmlinux\n }\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (_, _) = run(&registry, device.clone());
        assert_eq!(device.borrow().options()[0].name, "prev");
    }

    #[test]
    fn save_env_preserves_byte_length_on_append_and_shrink() {
        let mut body = "q=q\nr=r\n######".to_string();
        apply_grubenv_var(&mut body, "a", "xxx");
        assert_eq!(body, "q=q\nr=r\na=xxx\n");
        assert_eq!(body.len(), "q=q\nr=r\n######".len());

        let mut body2 = "q=q\na=xxx\nr=r\n".to_string();
        apply_grubenv_var(&mut body2, "a", "x");
        assert_eq!(body2, "q=q\na=x\nr=r\n##");
        assert_eq!(body2.len(), "q=q\na=xxx\nr=r\n".len());
    }

    #[test]
    fn save_env_roundtrip_through_grub2_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("grub")).unwrap();
        std::fs::write(
            dir.path().join("grub/grubenv"),
            "# GRUB Environment Block\nnext_entry=\n#######################",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("grub/grub.cfg"),
            "save_env next_entry\n\
             menuentry 'x' {\n linux /vmlinux\n }\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, _) = run(&registry, device.clone());
        assert_eq!(result, ParseResult::Found(1));
        let saved = std::fs::read_to_string(dir.path().join("grub/grubenv")).unwrap();
        assert!(saved.starts_with("# GRUB Environment Block\n"));
        assert_eq!(saved.len(), "# GRUB Environment Block\nnext_entry=\n#######################".len());
    }

    #[test]
    fn blscfg_scans_entries_newest_first_with_default_by_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("loader/entries")).unwrap();
        std::fs::write(
            dir.path().join("loader/entries/a-4.14.18.conf"),
            "title Fedora (4.14.18)\nlinux /vmlinuz-4.14.18\noptions root=/dev/sda1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("loader/entries/a-4.15.2.conf"),
            "title Fedora (4.15.2)\nlinux /vmlinuz-4.15.2\noptions root=/dev/sda1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "menuentry 'm1' {\n linux /m1\n }\n\
             menuentry 'm2' {\n linux /m2\n }\n\
             set default=2\n\
             blscfg\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, _) = run(&registry, device.clone());
        assert_eq!(result, ParseResult::Found(4));
        let d = device.borrow();
        assert_eq!(d.options()[2].name, "Fedora (4.15.2)");
        assert_eq!(d.options()[3].name, "Fedora (4.14.18)");
        assert!(d.options()[2].is_default);
    }

    #[test]
    fn test_builtin_checks_file_existence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present"), b"x").unwrap();
        std::fs::write(
            dir.path().join("grub.cfg"),
            "if [ -f /present ]; then\n\
             menuentry 'found' {\n linux /vmlinux\n }\n\
             fi\n\
             if [ -f /missing ]; then\n\
             menuentry 'notfound' {\n linux /vmlinux\n }\n\
             fi\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, _) = run(&registry, device.clone());
        assert_eq!(result, ParseResult::Found(1));
        assert_eq!(device.borrow().options()[0].name, "found");
    }

    #[test]
    fn parser_error_yields_no_options_without_crashing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("grub.cfg"), "{").unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, published) = run(&registry, device);
        assert_eq!(result, ParseResult::ApplicableButEmpty);
        assert_eq!(published, 0);
    }

    #[test]
    fn positional_param_ten_is_greedy_multi_digit() {
        let mut env = HashMap::new();
        env.insert("menuentry_id_option".to_string(), "--id".to_string());
        env.insert("prefix".to_string(), String::new());
        let registry = Registry::new();
        let device = {
            let mut d = Device::new("dev0", Classification::Disk);
            d.mount_point = Some(std::path::PathBuf::from("/"));
            StdRc::new(StdRefCell::new(d))
        };
        let ctx = DiscoverContext::new(device);
        let mut state = Grub2State::new(&ctx, &registry, "dev0".to_string(), String::new());
        state.pos_stack.push(vec![
            "1".into(), "2".into(), "3".into(), "4".into(), "5".into(),
            "6".into(), "7".into(), "8".into(), "9".into(), "bingo".into(),
        ]);
        assert_eq!(state.expand_str("$10"), "bingo");
        assert_eq!(state.expand_str("$1"), "1");
    }
}
