//! Recursive-descent parser over the token stream produced by
//! [`crate::lexer`] (spec §4.4/§4.5).
//!
//! The block-structure rule (spec §4.5 "Indentation contract") is enforced
//! here rather than in the lexer: each `:`-terminated header remembers its
//! own indent column, and [`Parser::block`] accepts statements at exactly
//! `header indent + 4`, stopping (and leaving the dedented token for the
//! caller) on anything shallower and erroring on anything deeper or on the
//! same source line as the header.

mod expr;
mod stmt;

use span::Span;

use crate::ast::Module;
use crate::error::{Error, Result};
use crate::lexer::{Lexer, Token, TokenKind};

pub fn parse<'src>(src: &'src str) -> Result<Module<'src>, Vec<Error>> {
  let lexer = Lexer::lex(src).map_err(|errs| errs)?;
  let mut parser = Parser {
    src,
    tokens: lexer.tokens,
    pos: 0,
    eof: lexer.eof,
  };
  parser.module().map_err(|e| vec![e])
}

pub(crate) struct Parser<'src> {
  pub(crate) src: &'src str,
  tokens: Vec<Token<'src>>,
  pos: usize,
  eof: Span,
}

impl<'src> Parser<'src> {
  fn module(&mut self) -> Result<Module<'src>> {
    let mut body = vec![];
    while !self.is_eof() {
      if self.ws() != 0 {
        return Err(Error::syntax("unexpected indentation at top level", self.span()));
      }
      body.push(self.stmt()?);
    }
    Ok(Module { body })
  }

  pub(crate) fn is_eof(&self) -> bool {
    self.pos >= self.tokens.len()
  }

  /// Indentation of the current token's line, or `0` at EOF.
  pub(crate) fn ws(&self) -> usize {
    if self.is_eof() {
      0
    } else {
      self.tokens[self.pos].ws
    }
  }

  /// The current token's kind, or `None` at EOF — there is no `Eof`
  /// variant in [`TokenKind`] itself, mirroring the teacher's lexer, which
  /// never produces one either.
  pub(crate) fn kind(&self) -> Option<TokenKind> {
    if self.is_eof() {
      None
    } else {
      Some(self.tokens[self.pos].kind)
    }
  }

  pub(crate) fn span(&self) -> Span {
    if self.is_eof() {
      self.eof
    } else {
      self.tokens[self.pos].span
    }
  }

  pub(crate) fn lexeme(&self) -> &'src str {
    self.tokens[self.pos].lexeme.as_ref()
  }

  pub(crate) fn at(&self, kind: TokenKind) -> bool {
    self.kind() == Some(kind)
  }

  pub(crate) fn bump(&mut self) -> &Token<'src> {
    let tok = &self.tokens[self.pos];
    self.pos += 1;
    tok
  }

  pub(crate) fn eat(&mut self, kind: TokenKind) -> bool {
    if self.at(kind) {
      self.pos += 1;
      true
    } else {
      false
    }
  }

  pub(crate) fn expect(&mut self, kind: TokenKind) -> Result<&Token<'src>> {
    if self.at(kind) {
      Ok(self.bump())
    } else {
      Err(Error::syntax(
        format!("expected `{kind}`, found `{}`", self.current_text()),
        self.span(),
      ))
    }
  }

  fn current_text(&self) -> &str {
    if self.is_eof() {
      "<eof>"
    } else {
      self.lexeme()
    }
  }

  /// Whether `self.peek()` sits on the same source line as the byte
  /// offset `after` (used to reject `if cond: body` on one line).
  fn same_line_as(&self, after: usize) -> bool {
    let start = after.min(self.src.len());
    let end = self.span().start.min(self.src.len());
    if start > end {
      return false;
    }
    !self.src[start..end].contains('\n')
  }

  /// Parse an indented block whose statements must sit at exactly
  /// `header_indent + 4`.
  pub(crate) fn block(&mut self, header_end: usize, header_indent: usize) -> Result<Vec<crate::ast::Stmt<'src>>> {
    let expected = header_indent + 4;

    if !self.is_eof() && self.ws() == 0 && self.same_line_as(header_end) {
      return Err(Error::syntax(
        "a block's body may not start on the same line as its header",
        self.span(),
      ));
    }

    let mut stmts = vec![];
    loop {
      if self.is_eof() {
        break;
      }
      let ws = self.ws();
      if ws < expected {
        break;
      }
      if ws > expected {
        return Err(Error::syntax(
          format!("unexpected indentation: expected {expected} spaces, found {ws}"),
          self.span(),
        ));
      }
      stmts.push(self.stmt()?);
    }

    if stmts.is_empty() {
      return Err(Error::syntax(
        "expected an indented block",
        self.span(),
      ));
    }

    Ok(stmts)
  }
}
