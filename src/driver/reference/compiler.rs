//! Reference OpenCL C front end.
//!
//! Only as much of the language is understood as the reference driver needs:
//! comments are stripped, brackets are balanced, preprocessor lines are
//! skipped, and every `__kernel` definition is parsed down to its name and
//! parameter list. Kernel bodies are not compiled; each kernel must have a
//! host implementation in the driver's [`KernelLibrary`]. When that
//! implementation was registered against a source text, the body being built
//! must match it token for token (whitespace and comments aside), so an
//! edited kernel fails to build instead of silently running the old code.
//!
//! Diagnostics are rendered in the clang style real drivers use, so build
//! logs read the same whether they come from here or from hardware:
//!
//! ```text
//! <source>:3:14: error: unknown type name 'flaot'
//!     __global flaot *a,
//!              ^
//! 1 error generated.
//! ```

use super::kernels::KernelLibrary;
use crate::diagnostics::Status;
use std::fmt::Write as _;

/// How a parameter is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamKind {
    /// `__global` / `__constant` pointer; bound to a memory object.
    Pointer,
    /// By-value scalar or vector.
    Scalar,
}

/// One kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Param {
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) kind: ParamKind,
    pub(crate) size: usize,
}

/// A kernel's name and parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Signature {
    pub(crate) name: String,
    pub(crate) params: Vec<Param>,
    /// The body with comments and whitespace removed.
    pub(crate) body: String,
}

/// Result of compiling one program.
#[derive(Debug)]
pub(crate) struct Compilation {
    pub(crate) result: Result<Vec<Signature>, Status>,
    pub(crate) log: String,
}

const POINTER_SIZE: usize = 8;

const FORBIDDEN_PARAM_TYPES: [&str; 5] = ["bool", "size_t", "ptrdiff_t", "intptr_t", "uintptr_t"];

/// Compiles `source` with `options` against the host kernels in `library`.
pub(crate) fn compile(source: &str, options: &str, library: &KernelLibrary) -> Compilation {
    let opts = match BuildOptions::parse(options) {
        Ok(opts) => opts,
        Err(message) => {
            return Compilation {
                result: Err(Status::INVALID_BUILD_OPTIONS),
                log: format!("<options>: error: {message}\n1 error generated.\n"),
            };
        }
    };

    let mut diag = Diagnostics::new(source, opts);
    let kernels = front_end(source, library, &mut diag);
    let failed = diag.errors > 0;
    let log = diag.finish();
    Compilation {
        result: if failed { Err(Status::BUILD_PROGRAM_FAILURE) } else { Ok(kernels) },
        log,
    }
}

fn front_end(source: &str, library: &KernelLibrary, diag: &mut Diagnostics<'_>) -> Vec<Signature> {
    let mut kernels: Vec<Signature> = Vec::new();
    for (sig, name_pos) in definitions(source, diag) {
        if kernels.iter().any(|k| k.name == sig.name) {
            diag.error(name_pos, &format!("redefinition of '{}'", sig.name));
        } else if !library.contains(&sig.name) {
            diag.error(
                name_pos,
                &format!("no host implementation registered for kernel '{}'", sig.name),
            );
        } else if library.pinned_body(&sig.name).is_some_and(|body| body != sig.body) {
            diag.error(
                name_pos,
                &format!("body of kernel '{}' differs from its registered host implementation", sig.name),
            );
        } else {
            kernels.push(sig);
        }
    }
    kernels
}

/// Every well-formed `__kernel` definition, in source order, with the
/// position of its name.
fn definitions(source: &str, diag: &mut Diagnostics<'_>) -> Vec<(Signature, usize)> {
    let stripped = match strip_comments(source.as_bytes()) {
        Ok(bytes) => bytes,
        Err(pos) => {
            diag.error(pos, "unterminated /* comment");
            return Vec::new();
        }
    };
    let tokens = lex(&stripped);
    if !check_brackets(&tokens, source.len(), diag) {
        return Vec::new();
    }

    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i].tok {
            Tok::Punct(b'(' | b'[' | b'{') => depth += 1,
            Tok::Punct(b')' | b']' | b'}') => depth = depth.saturating_sub(1),
            Tok::Ident(kw) if depth == 0 && (kw == "__kernel" || kw == "kernel") => {
                let (next, parsed) = parse_kernel(&stripped, &tokens, i + 1, diag);
                found.extend(parsed);
                i = next;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// The comment- and whitespace-free body of kernel `name` in `source`.
pub(crate) fn kernel_body(source: &str, name: &str) -> Option<String> {
    let mut scratch = Diagnostics::new(source, BuildOptions::default());
    definitions(source, &mut scratch)
        .into_iter()
        .find(|(sig, _)| sig.name == name)
        .map(|(sig, _)| sig.body)
}

fn squeeze(text: &[u8]) -> String {
    let kept: Vec<u8> = text.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    String::from_utf8_lossy(&kept).into_owned()
}

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct BuildOptions {
    werror: bool,
    no_warnings: bool,
}

impl BuildOptions {
    fn parse(options: &str) -> Result<Self, String> {
        let mut out = Self::default();
        let mut tokens = options.split_whitespace();
        while let Some(tok) = tokens.next() {
            if tok == "-w" {
                out.no_warnings = true;
            } else if tok == "-Werror" {
                out.werror = true;
            } else if tok == "-D" || tok == "-I" {
                let arg = tokens
                    .next()
                    .ok_or_else(|| format!("missing argument to '{tok}'"))?;
                if tok == "-D" {
                    check_define(arg)?;
                }
            } else if let Some(def) = tok.strip_prefix("-D") {
                check_define(def)?;
            } else if tok.starts_with("-I") || tok.starts_with("-cl-") {
                // accepted, no effect on the reference front end
            } else {
                return Err(format!("unknown build option '{tok}'"));
            }
        }
        Ok(out)
    }
}

fn check_define(def: &str) -> Result<(), String> {
    let name = def.split('=').next().unwrap_or_default();
    if is_identifier(name) {
        Ok(())
    } else {
        Err(format!("macro name must be an identifier in '-D{def}'"))
    }
}

fn is_identifier(s: &str) -> bool {
    let mut bytes = s.bytes();
    matches!(bytes.next(), Some(b) if b == b'_' || b.is_ascii_alphabetic())
        && bytes.all(|b| b == b'_' || b.is_ascii_alphanumeric())
}

// ── Diagnostics ─────────────────────────────────────────────────────────────

struct Diagnostics<'s> {
    source: &'s str,
    line_starts: Vec<usize>,
    opts: BuildOptions,
    out: String,
    errors: usize,
    warnings: usize,
}

impl<'s> Diagnostics<'s> {
    fn new(source: &'s str, opts: BuildOptions) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            source,
            line_starts,
            opts,
            out: String::new(),
            errors: 0,
            warnings: 0,
        }
    }

    fn error(&mut self, pos: usize, message: &str) {
        self.errors += 1;
        self.render(pos, "error", message);
    }

    fn warning(&mut self, pos: usize, message: &str, flag: &str) {
        if self.opts.no_warnings {
            return;
        }
        if self.opts.werror {
            self.errors += 1;
            self.render(pos, "error", &format!("{message} [-Werror,{flag}]"));
        } else {
            self.warnings += 1;
            self.render(pos, "warning", &format!("{message} [{flag}]"));
        }
    }

    fn note(&mut self, pos: usize, message: &str) {
        self.render(pos, "note", message);
    }

    fn render(&mut self, pos: usize, severity: &str, message: &str) {
        let pos = pos.min(self.source.len());
        let line = match self.line_starts.binary_search(&pos) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let start = self.line_starts[line];
        let end = self
            .line_starts
            .get(line + 1)
            .map_or(self.source.len(), |next| next - 1);
        let text = self.source.get(start..end).unwrap_or_default().trim_end_matches('\r');
        let col = pos - start + 1;
        let caret: String = text
            .bytes()
            .take(col - 1)
            .map(|b| if b == b'\t' { '\t' } else { ' ' })
            .collect();
        let _ = writeln!(self.out, "<source>:{}:{col}: {severity}: {message}", line + 1);
        let _ = writeln!(self.out, "{text}");
        let _ = writeln!(self.out, "{caret}^");
    }

    fn finish(mut self) -> String {
        let plural = |n: usize, word: &str| {
            if n == 1 { format!("1 {word}") } else { format!("{n} {word}s") }
        };
        match (self.warnings, self.errors) {
            (0, 0) => {}
            (w, 0) => {
                let _ = writeln!(self.out, "{} generated.", plural(w, "warning"));
            }
            (0, e) => {
                let _ = writeln!(self.out, "{} generated.", plural(e, "error"));
            }
            (w, e) => {
                let _ = writeln!(
                    self.out,
                    "{} and {} generated.",
                    plural(w, "warning"),
                    plural(e, "error")
                );
            }
        }
        self.out
    }
}

// ── Lexing ──────────────────────────────────────────────────────────────────

/// Replaces comments with spaces, keeping byte offsets and newlines.
fn strip_comments(src: &[u8]) -> Result<Vec<u8>, usize> {
    let mut out = src.to_vec();
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'"' | b'\'' => {
                let quote = src[i];
                i += 1;
                while i < src.len() && src[i] != quote && src[i] != b'\n' {
                    if src[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'/' if src.get(i + 1) == Some(&b'/') => {
                while i < src.len() && src[i] != b'\n' {
                    out[i] = b' ';
                    i += 1;
                }
            }
            b'/' if src.get(i + 1) == Some(&b'*') => {
                let open = i;
                out[i] = b' ';
                out[i + 1] = b' ';
                i += 2;
                loop {
                    if i + 1 >= src.len() {
                        return Err(open);
                    }
                    if src[i] == b'*' && src[i + 1] == b'/' {
                        out[i] = b' ';
                        out[i + 1] = b' ';
                        i += 2;
                        break;
                    }
                    if src[i] != b'\n' {
                        out[i] = b' ';
                    }
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Number,
    Literal,
    Punct(u8),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: usize,
}

fn lex(src: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line_start = true;
    while i < src.len() {
        let b = src[i];
        if b == b'\n' {
            line_start = true;
            i += 1;
            continue;
        }
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b == b'#' && line_start {
            // preprocessor directive, honouring line continuations
            while i < src.len() {
                if src[i] == b'\n' && src.get(i.wrapping_sub(1)) != Some(&b'\\') {
                    break;
                }
                i += 1;
            }
            continue;
        }
        line_start = false;
        let pos = i;
        if b == b'_' || b.is_ascii_alphabetic() {
            while i < src.len() && (src[i] == b'_' || src[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            let ident = String::from_utf8_lossy(&src[pos..i]).into_owned();
            tokens.push(Token { tok: Tok::Ident(ident), pos });
        } else if b.is_ascii_digit() {
            while i < src.len() && (src[i] == b'.' || src[i] == b'_' || src[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            tokens.push(Token { tok: Tok::Number, pos });
        } else if b == b'"' || b == b'\'' {
            i += 1;
            while i < src.len() && src[i] != b && src[i] != b'\n' {
                if src[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            tokens.push(Token { tok: Tok::Literal, pos });
        } else {
            i += 1;
            tokens.push(Token { tok: Tok::Punct(b), pos });
        }
    }
    tokens
}

const fn closer(open: u8) -> u8 {
    match open {
        b'(' => b')',
        b'[' => b']',
        _ => b'}',
    }
}

fn check_brackets(tokens: &[Token], eof: usize, diag: &mut Diagnostics<'_>) -> bool {
    let mut stack: Vec<(u8, usize)> = Vec::new();
    for t in tokens {
        match t.tok {
            Tok::Punct(open @ (b'(' | b'[' | b'{')) => stack.push((open, t.pos)),
            Tok::Punct(close @ (b')' | b']' | b'}')) => match stack.pop() {
                Some((open, _)) if closer(open) == close => {}
                Some((open, open_pos)) => {
                    diag.error(t.pos, &format!("expected '{}'", closer(open) as char));
                    diag.note(open_pos, &format!("to match this '{}'", open as char));
                    return false;
                }
                None => {
                    diag.error(t.pos, &format!("extraneous closing bracket ('{}')", close as char));
                    return false;
                }
            },
            _ => {}
        }
    }
    if let Some((open, open_pos)) = stack.pop() {
        diag.error(eof, &format!("expected '{}'", closer(open) as char));
        diag.note(open_pos, &format!("to match this '{}'", open as char));
        return false;
    }
    true
}

// ── Kernel declarations ─────────────────────────────────────────────────────

/// Index one past the bracket group opening at `open`. Brackets are balanced.
fn skip_group(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    let mut i = open;
    while i < tokens.len() {
        match tokens[i].tok {
            Tok::Punct(b'(' | b'[' | b'{') => depth += 1,
            Tok::Punct(b')' | b']' | b'}') => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    tokens.len()
}

fn ident(tokens: &[Token], i: usize) -> Option<&str> {
    match tokens.get(i).map(|t| &t.tok) {
        Some(Tok::Ident(s)) => Some(s),
        _ => None,
    }
}

fn punct(tokens: &[Token], i: usize) -> Option<u8> {
    match tokens.get(i).map(|t| &t.tok) {
        Some(Tok::Punct(b)) => Some(*b),
        _ => None,
    }
}

fn pos_at(tokens: &[Token], i: usize) -> usize {
    tokens.get(i).or(tokens.last()).map_or(0, |t| t.pos)
}

/// Parses the declaration after a `__kernel` keyword. Returns the index to
/// resume scanning at and, if the declaration was well-formed, the kernel's
/// signature with the position of its name.
fn parse_kernel(
    src: &[u8],
    tokens: &[Token],
    mut i: usize,
    diag: &mut Diagnostics<'_>,
) -> (usize, Option<(Signature, usize)>) {
    let mut return_type: Vec<(usize, &str)> = Vec::new();
    let name_idx = loop {
        match (ident(tokens, i), punct(tokens, i + 1)) {
            (Some("__attribute__"), Some(b'(')) => i = skip_group(tokens, i + 1),
            (Some(_), Some(b'(')) => break i,
            (Some(word), _) => {
                return_type.push((i, word));
                i += 1;
            }
            _ => {
                diag.error(pos_at(tokens, i), "expected kernel function declarator");
                return (i + 1, None);
            }
        }
    };
    let name = ident(tokens, name_idx).unwrap_or_default().to_owned();
    let name_pos = tokens[name_idx].pos;

    let open = name_idx + 1;
    let close = skip_group(tokens, open);
    let params_end = close - 1;

    let return_words: Vec<&str> = return_type
        .iter()
        .map(|&(_, w)| w)
        .filter(|w| !matches!(*w, "static" | "inline"))
        .collect();
    if return_words != ["void"] {
        let at = return_type.first().map_or(name_pos, |&(idx, _)| tokens[idx].pos);
        diag.error(at, "kernel must have void return type");
        return (close, None);
    }

    let mut params = Vec::new();
    let mut ok = true;
    for (start, end) in split_params(tokens, open + 1, params_end) {
        match parse_param(&tokens[start..end]) {
            Ok(Some(param)) => params.push((param, pos_of_name(&tokens[start..end]))),
            Ok(None) => {}
            Err((pos, message)) => {
                diag.error(pos, &message);
                ok = false;
            }
        }
    }

    if punct(tokens, close) != Some(b'{') {
        diag.error(pos_at(tokens, close), "expected function body after kernel declarator");
        return (close, None);
    }
    let body_end = skip_group(tokens, close);
    let body = &tokens[close..body_end];
    for (param, pos) in &params {
        let used = body.iter().any(|t| matches!(&t.tok, Tok::Ident(s) if *s == param.name));
        if !used {
            diag.warning(*pos, &format!("unused parameter '{}'", param.name), "-Wunused-parameter");
        }
    }

    if !ok {
        return (body_end, None);
    }
    let body_span = tokens[close].pos..tokens[body_end - 1].pos + 1;
    let sig = Signature {
        name,
        params: params.into_iter().map(|(p, _)| p).collect(),
        body: squeeze(&src[body_span]),
    };
    (body_end, Some((sig, name_pos)))
}

/// Splits `tokens[start..end]` at top-level commas.
fn split_params(tokens: &[Token], start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut groups = Vec::new();
    let mut depth = 0usize;
    let mut from = start;
    for i in start..end {
        match tokens[i].tok {
            Tok::Punct(b'(' | b'[' | b'{') => depth += 1,
            Tok::Punct(b')' | b']' | b'}') => depth = depth.saturating_sub(1),
            Tok::Punct(b',') if depth == 0 => {
                groups.push((from, i));
                from = i + 1;
            }
            _ => {}
        }
    }
    if from < end {
        groups.push((from, end));
    }
    groups
}

fn pos_of_name(group: &[Token]) -> usize {
    group
        .iter()
        .rev()
        .find(|t| matches!(t.tok, Tok::Ident(_)))
        .or(group.first())
        .map_or(0, |t| t.pos)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressSpace {
    Global,
    Constant,
    Local,
    Private,
}

fn address_space(word: &str) -> Option<AddressSpace> {
    match word {
        "__global" | "global" => Some(AddressSpace::Global),
        "__constant" | "constant" => Some(AddressSpace::Constant),
        "__local" | "local" => Some(AddressSpace::Local),
        "__private" | "private" => Some(AddressSpace::Private),
        _ => None,
    }
}

fn is_type_qualifier(word: &str) -> bool {
    matches!(word, "const" | "volatile" | "restrict" | "__restrict")
}

fn parse_param(group: &[Token]) -> Result<Option<Param>, (usize, String)> {
    let start = group.first().map_or(0, |t| t.pos);
    if let [Token { tok: Tok::Ident(v), .. }] = group {
        if v == "void" {
            return Ok(None);
        }
    }

    let mut space = None;
    let mut pointer = false;
    let mut words: Vec<(usize, &str)> = Vec::new();
    for t in group {
        match &t.tok {
            Tok::Ident(w) => {
                if let Some(s) = address_space(w) {
                    space = Some(s);
                } else if !is_type_qualifier(w) {
                    words.push((t.pos, w));
                }
            }
            Tok::Punct(b'*') => pointer = true,
            Tok::Punct(b'[') => {
                return Err((t.pos, "array parameters are not supported in kernel signatures".into()));
            }
            _ => return Err((t.pos, "expected parameter declarator".into())),
        }
    }

    let Some(((_, name), type_words)) = words.split_last() else {
        return Err((start, "expected parameter declarator".into()));
    };
    if type_words.is_empty() {
        return Err((start, format!("type specifier missing for parameter '{name}'")));
    }
    let type_pos = type_words[0].0;
    let type_name = normalise_type(type_words)
        .ok_or_else(|| (type_pos, format!("unknown type name '{}'", join_words(type_words))))?;

    if pointer {
        match space {
            Some(AddressSpace::Global | AddressSpace::Constant) => {}
            Some(AddressSpace::Local) => {
                return Err((start, format!("__local parameter '{name}' is not supported by this device")));
            }
            Some(AddressSpace::Private) | None => {
                return Err((
                    start,
                    format!("pointer parameter '{name}' must point to __global or __constant memory"),
                ));
            }
        }
        if type_name != "void" && type_size(&type_name).is_none() {
            return Err((type_pos, format!("unknown type name '{type_name}'")));
        }
        return Ok(Some(Param {
            name: (*name).to_owned(),
            type_name: format!("{type_name}*"),
            kind: ParamKind::Pointer,
            size: POINTER_SIZE,
        }));
    }

    if matches!(space, Some(AddressSpace::Global | AddressSpace::Constant | AddressSpace::Local)) {
        return Err((start, format!("parameter '{name}' may not be qualified with an address space")));
    }
    if FORBIDDEN_PARAM_TYPES.contains(&type_name.as_str()) {
        return Err((type_pos, format!("'{type_name}' cannot be used as the type of a kernel parameter")));
    }
    let size = type_size(&type_name)
        .ok_or_else(|| (type_pos, format!("unknown type name '{type_name}'")))?;
    Ok(Some(Param {
        name: (*name).to_owned(),
        type_name,
        kind: ParamKind::Scalar,
        size,
    }))
}

fn join_words(words: &[(usize, &str)]) -> String {
    words.iter().map(|&(_, w)| w).collect::<Vec<_>>().join(" ")
}

/// Folds `unsigned int` into `uint` and friends.
fn normalise_type(words: &[(usize, &str)]) -> Option<String> {
    let words: Vec<&str> = words.iter().map(|&(_, w)| w).collect();
    match words.as_slice() {
        ["unsigned"] => Some("uint".to_owned()),
        ["unsigned", base @ ("char" | "short" | "int" | "long")] => Some(format!("u{base}")),
        ["signed", base @ ("char" | "short" | "int" | "long")] => Some((*base).to_owned()),
        ["struct" | "union" | "enum", ..] => None,
        [single] => Some((*single).to_owned()),
        _ => None,
    }
}

/// Size in bytes of a by-value OpenCL C type.
pub(crate) fn type_size(name: &str) -> Option<usize> {
    let scalar = |base: &str| match base {
        "char" | "uchar" => Some(1),
        "short" | "ushort" | "half" => Some(2),
        "int" | "uint" | "float" => Some(4),
        "long" | "ulong" | "double" => Some(8),
        "bool" | "size_t" | "ptrdiff_t" | "intptr_t" | "uintptr_t" => Some(POINTER_SIZE),
        _ => None,
    };
    if let Some(size) = scalar(name) {
        return Some(size);
    }
    let digits = name.bytes().rev().take_while(u8::is_ascii_digit).count();
    let (base, lanes) = name.split_at(name.len() - digits);
    let lanes = match lanes {
        "2" => 2,
        "3" | "4" => 4,
        "8" => 8,
        "16" => 16,
        _ => return None,
    };
    if matches!(base, "bool" | "size_t" | "ptrdiff_t" | "intptr_t" | "uintptr_t") {
        return None;
    }
    scalar(base).map(|s| s * lanes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::reference::kernels::{ArgView, Stores, WorkItem};

    fn noop(_: &WorkItem, _: &ArgView<'_>, _: &mut Stores) {}

    fn library(names: &[&str]) -> KernelLibrary {
        names.iter().fold(KernelLibrary::new(), |lib, n| lib.with(*n, noop))
    }

    #[test]
    fn sizes_follow_the_type_table() {
        assert_eq!(type_size("char"), Some(1));
        assert_eq!(type_size("uint"), Some(4));
        assert_eq!(type_size("float3"), Some(16));
        assert_eq!(type_size("float4"), Some(16));
        assert_eq!(type_size("double16"), Some(128));
        assert_eq!(type_size("float5"), None);
        assert_eq!(type_size("flaot"), None);
    }

    #[test]
    fn parses_signatures() {
        let src = "// adds\n__kernel void add(__global const float *a, __global float *b, const uint n) {\n  b[0] = a[0] + n;\n}\n";
        let out = compile(src, "", &library(&["add"]));
        let sigs = out.result.unwrap();
        assert_eq!(out.log, "");
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].name, "add");
        let kinds: Vec<_> = sigs[0].params.iter().map(|p| (p.kind, p.size)).collect();
        assert_eq!(kinds, vec![(ParamKind::Pointer, 8), (ParamKind::Pointer, 8), (ParamKind::Scalar, 4)]);
        assert_eq!(sigs[0].params[2].name, "n");
    }

    #[test]
    fn unsigned_int_is_uint() {
        let src = "kernel void k(global int *o, unsigned int n) { o[0] = n; }";
        let sigs = compile(src, "", &library(&["k"])).result.unwrap();
        assert_eq!(sigs[0].params[1].type_name, "uint");
        assert_eq!(sigs[0].params[1].size, 4);
    }

    #[test]
    fn unknown_type_is_located() {
        let src = "__kernel void add(\n    __global flaot *a)\n{ a[0] = 0; }\n";
        let out = compile(src, "", &library(&["add"]));
        assert_eq!(out.result, Err(Status::BUILD_PROGRAM_FAILURE));
        assert_eq!(
            out.log,
            "<source>:2:14: error: unknown type name 'flaot'\n    __global flaot *a)\n             ^\n1 error generated.\n"
        );
    }

    #[test]
    fn unbalanced_braces() {
        let src = "__kernel void k(__global int *o) {\n  o[0] = 1;\n";
        let out = compile(src, "", &library(&["k"]));
        assert_eq!(out.result, Err(Status::BUILD_PROGRAM_FAILURE));
        assert!(out.log.contains("error: expected '}'"));
        assert!(out.log.contains("<source>:1:34: note: to match this '{'"));
    }

    #[test]
    fn rejects_forbidden_parameters() {
        let src = "__kernel void k(__global int *o, size_t n, __local float *scratch) { o[n] = scratch[0]; }";
        let out = compile(src, "", &library(&["k"]));
        assert!(out.log.contains("'size_t' cannot be used as the type of a kernel parameter"));
        assert!(out.log.contains("__local parameter 'scratch'"));
        assert!(out.log.ends_with("2 errors generated.\n"));
    }

    #[test]
    fn non_void_kernel() {
        let out = compile("__kernel int k(__global int *o) { return o[0]; }", "", &library(&["k"]));
        assert!(out.log.contains("error: kernel must have void return type"));
    }

    #[test]
    fn missing_host_implementation() {
        let out = compile("__kernel void other(__global int *o) { o[0] = 1; }", "", &library(&["k"]));
        assert!(out.log.contains("no host implementation registered for kernel 'other'"));
    }

    #[test]
    fn pinned_bodies_must_match() {
        const ADD: &str = "__kernel void add(__global int *o) {\n    o[0] = o[0] + 1;\n}\n";
        let lib = KernelLibrary::new().with_source("add", ADD, noop);

        // Layout and comments do not matter.
        let reformatted = "/* same */ __kernel void add(__global int *o)\n{ o[0] = o[0]+1; // bump\n}";
        assert!(compile(reformatted, "", &lib).result.is_ok());

        let edited = "__kernel void add(__global int *o) {\n    o[0] = o[0] - 1;\n}\n";
        let out = compile(edited, "", &lib);
        assert_eq!(out.result, Err(Status::BUILD_PROGRAM_FAILURE));
        assert!(out.log.contains("<source>:1:15: error: body of kernel 'add' differs from its registered host implementation"), "{}", out.log);
    }

    #[test]
    fn kernel_bodies_are_squeezed() {
        let src = "__kernel void k(__global int *o) {\n  o[0] = 1; /* set */\n}\n__kernel void j(__global int *o) { }";
        assert_eq!(kernel_body(src, "k").as_deref(), Some("{o[0]=1;}"));
        assert_eq!(kernel_body(src, "j").as_deref(), Some("{}"));
        assert_eq!(kernel_body(src, "missing"), None);
    }

    #[test]
    fn unused_parameters_warn_and_werror_promotes() {
        let src = "__kernel void k(__global int *o, uint n) { o[0] = 1; }";
        let lib = library(&["k"]);

        let warned = compile(src, "", &lib);
        assert!(warned.result.is_ok());
        assert!(warned.log.contains("warning: unused parameter 'n' [-Wunused-parameter]"));
        assert!(warned.log.ends_with("1 warning generated.\n"));

        let quiet = compile(src, "-w", &lib);
        assert_eq!(quiet.log, "");

        let promoted = compile(src, "-Werror", &lib);
        assert_eq!(promoted.result, Err(Status::BUILD_PROGRAM_FAILURE));
        assert!(promoted.log.contains("error: unused parameter 'n' [-Werror,-Wunused-parameter]"));
    }

    #[test]
    fn build_options() {
        let lib = library(&["k"]);
        let src = "__kernel void k(__global int *o) { o[0] = 1; }";
        assert!(compile(src, "-DN=4 -D M -I include -cl-fast-relaxed-math", &lib).result.is_ok());
        let bad = compile(src, "-O3", &lib);
        assert_eq!(bad.result, Err(Status::INVALID_BUILD_OPTIONS));
        assert!(bad.log.contains("unknown build option '-O3'"));
        assert_eq!(compile(src, "-D 4x", &lib).result, Err(Status::INVALID_BUILD_OPTIONS));
    }

    #[test]
    fn comments_and_directives_are_ignored() {
        let src = "#define W 4\n/* __kernel void hidden(int x) { */\n__kernel void k(__global char *c) { c[0] = '{'; }\n";
        let sigs = compile(src, "", &library(&["k"])).result.unwrap();
        assert_eq!(sigs.len(), 1);
    }

    #[test]
    fn unterminated_comment() {
        let out = compile("__kernel void k() {}\n/* open", "", &library(&["k"]));
        assert!(out.log.starts_with("<source>:2:1: error: unterminated /* comment"));
    }
}
