//! Source → token stream (spec §4.1).
//!
//! Tokenization itself is handled by `logos`; this module layers
//! indentation accounting on top of it, exactly as the teacher's
//! `logos`-based lexer does, extended with the multiple-of-4 indent rule
//! and the `--`/`'''` comment forms EchoC requires instead of hebi's `#`.
//!
//! String interpolation (`%{expr}`) is *not* resolved here: a string token
//! carries its raw delimited text, and [`crate::parser`] splits it into
//! literal/interpolated parts once it has a `Parser` available to recurse
//! into for each `%{...}` segment (spec §4.1, §8 property 11).

use std::fmt;

use beef::lean::Cow;
use logos::Logos;
use span::Span;

use crate::error::Error;

#[derive(Clone, Debug)]
pub struct Token<'src> {
  /// Indentation (in spaces) of this token's line, if it is the first
  /// token on that line; `0` otherwise.
  pub ws: usize,
  pub lexeme: Cow<'src, str>,
  pub kind: TokenKind,
  pub span: Span,
}

impl<'src> Token<'src> {
  pub fn is(&self, kind: TokenKind) -> bool {
    std::mem::discriminant(&self.kind) == std::mem::discriminant(&kind)
  }
}

#[derive(Logos, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
  #[regex(r"\n[ \t]*")]
  _Indentation,
  #[regex(r"[ \t\r]+", logos::skip)]
  _Whitespace,
  #[regex(r"--[^\n]*")]
  #[regex(r"'''([^']|'[^']|''[^'])*'''")]
  _Comment,
  #[error]
  _Error,

  #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
  Ident,

  /// `0`, `1.0`, etc. — the parser tells int and float apart by checking
  /// the lexeme for a `.`, mirroring the teacher's single `Lit_Number`
  /// token.
  #[regex(r"[0-9][0-9_]*(\.[0-9][0-9_]*)?")]
  Num,

  #[regex(r#""([^"\\]|\\.)*""#)]
  #[regex(r#"'([^'\\]|\\.)*'"#)]
  #[regex(r"```([^`]|`[^`]|``[^`])*```")]
  Str,

  #[token("let")]
  Let,
  #[token("if")]
  If,
  #[token("elif")]
  Elif,
  #[token("else")]
  Else,
  #[token("loop")]
  Loop,
  #[token("while")]
  While,
  #[token("for")]
  For,
  #[token("from")]
  From,
  #[token("to")]
  To,
  #[token("step")]
  Step,
  #[token("in")]
  In,
  #[token("break")]
  Break,
  #[token("continue")]
  Continue,
  #[token("skip")]
  Skip,
  #[token("raise")]
  Raise,
  #[token("return")]
  Return,
  #[token("try")]
  Try,
  #[token("catch")]
  Catch,
  #[token("finally")]
  Finally,
  #[token("as")]
  As,
  #[token("funct")]
  Funct,
  #[token("async")]
  Async,
  #[token("await")]
  Await,
  #[token("blueprint")]
  Blueprint,
  #[token("inherits")]
  Inherits,
  #[token("load")]
  Load,
  #[token("is")]
  Is,
  #[token("not")]
  Not,
  #[token("and")]
  And,
  #[token("or")]
  Or,
  #[token("true")]
  True,
  #[token("false")]
  False,
  #[token("null")]
  Null,
  #[token("self")]
  SelfKw,
  #[token("super")]
  Super,

  #[token(":")]
  Colon,
  #[token(",")]
  Comma,
  #[token(".")]
  Dot,
  #[token("(")]
  LParen,
  #[token(")")]
  RParen,
  #[token("[")]
  LBracket,
  #[token("]")]
  RBracket,
  #[token("{")]
  LBrace,
  #[token("}")]
  RBrace,
  #[token("=")]
  Equal,
  #[token("==")]
  EqEq,
  #[token("!=")]
  NotEq,
  #[token("<")]
  Lt,
  #[token("<=")]
  LtEq,
  #[token(">")]
  Gt,
  #[token(">=")]
  GtEq,
  #[token("+")]
  Plus,
  #[token("-")]
  Minus,
  #[token("*")]
  Star,
  #[token("/")]
  Slash,
  #[token("%")]
  Percent,
  #[token("^")]
  Caret,
}

impl fmt::Display for TokenKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{self:?}")
  }
}

pub struct Lexer<'src> {
  pub tokens: Vec<Token<'src>>,
  pub eof: Span,
}

impl<'src> Lexer<'src> {
  pub fn lex(src: &'src str) -> Result<Self, Vec<Error>> {
    let eof_span: Span = (src.len()..src.len()).into();

    let mut ws = 0usize;
    let mut errors = vec![];
    let mut tokens = vec![];
    let mut inner = logos::Lexer::<'src, TokenKind>::new(src);
    while let Some(kind) = inner.next() {
      let lexeme = inner.slice();
      let span: Span = inner.span().into();

      match kind {
        TokenKind::_Indentation => {
          let indent = lexeme.trim_start_matches(['\n', '\r']);
          if indent.contains('\t') {
            errors.push(Error::lexical(
              "tabs are not allowed for indentation",
              span,
            ));
          }
          ws = indent.len();
        }
        TokenKind::_Whitespace | TokenKind::_Comment => continue,
        TokenKind::_Error => {
          errors.push(Error::lexical(
            format!("unexpected character `{lexeme}`"),
            span,
          ));
          continue;
        }
        _ => {
          if ws % 4 != 0 {
            errors.push(Error::lexical(
              "indentation must be a multiple of 4 spaces",
              span,
            ));
          }
          tokens.push(Token {
            ws,
            lexeme: lexeme.into(),
            kind,
            span,
          });
          ws = 0;
        }
      }
    }

    if !errors.is_empty() {
      tracing::debug!(count = errors.len(), "lexical errors");
      Err(errors)
    } else {
      tracing::trace!(tokens = tokens.len(), "lexed");
      Ok(Lexer {
        tokens,
        eof: eof_span,
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn kinds(src: &str) -> Vec<TokenKind> {
    Lexer::lex(src)
      .unwrap()
      .tokens
      .into_iter()
      .map(|t| t.kind)
      .collect()
  }

  #[test]
  fn lexes_let_statement() {
    use TokenKind::*;
    assert_eq!(
      kinds("let: x = 1:"),
      vec![Let, Colon, Ident, Equal, Num, Colon]
    );
  }

  #[test]
  fn comment_to_end_of_line_is_skipped() {
    use TokenKind::*;
    assert_eq!(kinds("let: x = 1: -- trailing comment"), vec![
      Let, Colon, Ident, Equal, Num, Colon
    ]);
  }

  #[test]
  fn rejects_tab_indentation() {
    let src = "if x:\n\tshow(x):";
    assert!(Lexer::lex(src).is_err());
  }

  #[test]
  fn rejects_non_multiple_of_four_indentation() {
    let src = "if x:\n  show(x):";
    assert!(Lexer::lex(src).is_err());
  }

  #[test]
  fn accepts_four_space_indentation() {
    let src = "if x:\n    show(x):";
    assert!(Lexer::lex(src).is_ok());
  }
}
