//! Expression grammar: the precedence-climbing chain from spec §4.4,
//! lowest to highest precedence:
//!
//! conditional → await → or → and → equality → identity → comparison
//! → additive → multiplicative → unary → power → postfix → primary

use beef::lean::Cow;
use span::{Span, Spanned};

use super::Parser;
use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::TokenKind;

impl<'src> Parser<'src> {
  pub(crate) fn expr(&mut self) -> Result<Expr<'src>> {
    self.conditional()
  }

  fn conditional(&mut self) -> Result<Expr<'src>> {
    let start = self.span();
    let value = self.await_expr()?;
    if self.eat(TokenKind::If) {
      let cond = self.await_expr()?;
      self.expect(TokenKind::Else)?;
      let or_else = self.conditional()?;
      let span = start.join(or_else.span);
      return Ok(Spanned::new(
        span,
        ExprKind::Cond(Box::new(value), Box::new(cond), Box::new(or_else)),
      ));
    }
    Ok(value)
  }

  fn await_expr(&mut self) -> Result<Expr<'src>> {
    if self.at(TokenKind::Await) {
      let start = self.span();
      self.bump();
      let inner = self.logical_or()?;
      let span = start.join(inner.span);
      return Ok(Spanned::new(span, ExprKind::Await(Box::new(inner))));
    }
    self.logical_or()
  }

  fn logical_or(&mut self) -> Result<Expr<'src>> {
    let mut left = self.logical_and()?;
    while self.eat(TokenKind::Or) {
      let right = self.logical_and()?;
      let span = left.span.join(right.span);
      left = Spanned::new(
        span,
        ExprKind::Logical(LogicalOp::Or, Box::new(left), Box::new(right)),
      );
    }
    Ok(left)
  }

  fn logical_and(&mut self) -> Result<Expr<'src>> {
    let mut left = self.equality()?;
    while self.eat(TokenKind::And) {
      let right = self.equality()?;
      let span = left.span.join(right.span);
      left = Spanned::new(
        span,
        ExprKind::Logical(LogicalOp::And, Box::new(left), Box::new(right)),
      );
    }
    Ok(left)
  }

  fn equality(&mut self) -> Result<Expr<'src>> {
    let mut left = self.identity()?;
    loop {
      let op = if self.eat(TokenKind::EqEq) {
        BinaryOp::Eq
      } else if self.eat(TokenKind::NotEq) {
        BinaryOp::Ne
      } else {
        break;
      };
      let right = self.identity()?;
      let span = left.span.join(right.span);
      left = Spanned::new(span, ExprKind::Binary(op, Box::new(left), Box::new(right)));
    }
    Ok(left)
  }

  fn identity(&mut self) -> Result<Expr<'src>> {
    let mut left = self.comparison()?;
    while self.at(TokenKind::Is) {
      self.bump();
      let op = if self.eat(TokenKind::Not) {
        BinaryOp::IsNot
      } else {
        BinaryOp::Is
      };
      let right = self.comparison()?;
      let span = left.span.join(right.span);
      left = Spanned::new(span, ExprKind::Binary(op, Box::new(left), Box::new(right)));
    }
    Ok(left)
  }

  fn comparison(&mut self) -> Result<Expr<'src>> {
    let mut left = self.additive()?;
    loop {
      let op = if self.eat(TokenKind::Lt) {
        BinaryOp::Lt
      } else if self.eat(TokenKind::LtEq) {
        BinaryOp::Le
      } else if self.eat(TokenKind::Gt) {
        BinaryOp::Gt
      } else if self.eat(TokenKind::GtEq) {
        BinaryOp::Ge
      } else {
        break;
      };
      let right = self.additive()?;
      let span = left.span.join(right.span);
      left = Spanned::new(span, ExprKind::Binary(op, Box::new(left), Box::new(right)));
    }
    Ok(left)
  }

  fn additive(&mut self) -> Result<Expr<'src>> {
    let mut left = self.multiplicative()?;
    loop {
      let op = if self.eat(TokenKind::Plus) {
        BinaryOp::Add
      } else if self.eat(TokenKind::Minus) {
        BinaryOp::Sub
      } else {
        break;
      };
      let right = self.multiplicative()?;
      let span = left.span.join(right.span);
      left = Spanned::new(span, ExprKind::Binary(op, Box::new(left), Box::new(right)));
    }
    Ok(left)
  }

  fn multiplicative(&mut self) -> Result<Expr<'src>> {
    let mut left = self.unary()?;
    loop {
      let op = if self.eat(TokenKind::Star) {
        BinaryOp::Mul
      } else if self.eat(TokenKind::Slash) {
        BinaryOp::Div
      } else if self.eat(TokenKind::Percent) {
        BinaryOp::Rem
      } else {
        break;
      };
      let right = self.unary()?;
      let span = left.span.join(right.span);
      left = Spanned::new(span, ExprKind::Binary(op, Box::new(left), Box::new(right)));
    }
    Ok(left)
  }

  fn unary(&mut self) -> Result<Expr<'src>> {
    if self.at(TokenKind::Minus) || self.at(TokenKind::Not) {
      let start = self.span();
      let op = if self.eat(TokenKind::Minus) {
        UnaryOp::Neg
      } else {
        self.bump();
        UnaryOp::Not
      };
      let operand = self.unary()?;
      let span = start.join(operand.span);
      return Ok(Spanned::new(span, ExprKind::Unary(op, Box::new(operand))));
    }
    self.power()
  }

  fn power(&mut self) -> Result<Expr<'src>> {
    let left = self.postfix()?;
    if self.eat(TokenKind::Caret) {
      // right-associative, and the exponent may itself be unary (`2^-3`).
      let right = self.unary()?;
      let span = left.span.join(right.span);
      return Ok(Spanned::new(
        span,
        ExprKind::Binary(BinaryOp::Pow, Box::new(left), Box::new(right)),
      ));
    }
    Ok(left)
  }

  fn postfix(&mut self) -> Result<Expr<'src>> {
    let mut expr = self.primary()?;
    loop {
      match self.kind() {
        Some(TokenKind::LParen) => {
          let args = self.call_args()?;
          let span = expr.span.join(self.prev_span());
          expr = Spanned::new(span, ExprKind::Call(Box::new(expr), args));
        }
        Some(TokenKind::LBracket) => {
          self.bump();
          let index = self.expr()?;
          let end = self.expect(TokenKind::RBracket)?.span;
          let span = expr.span.join(end);
          expr = Spanned::new(span, ExprKind::Index(Box::new(expr), Box::new(index), false));
        }
        Some(TokenKind::Dot) => {
          self.bump();
          let name = self.ident()?;
          let span = expr.span.join(name.span);
          expr = Spanned::new(span, ExprKind::Attr(Box::new(expr), name, false));
        }
        _ => break,
      }
    }
    Ok(expr)
  }

  fn call_args(&mut self) -> Result<Args<'src>> {
    self.expect(TokenKind::LParen)?;
    let mut args = Args::default();
    let mut seen_named = false;
    while !self.at(TokenKind::RParen) {
      if self.at(TokenKind::Ident) && self.peek_is_named_arg() {
        let name = self.ident()?;
        self.expect(TokenKind::Equal)?;
        let value = self.expr()?;
        args.named.push((name, value));
        seen_named = true;
      } else {
        if seen_named {
          return Err(Error::syntax(
            "positional arguments may not follow named arguments",
            self.span(),
          ));
        }
        args.positional.push(self.expr()?);
      }
      if !self.eat(TokenKind::Comma) {
        break;
      }
    }
    self.expect(TokenKind::RParen)?;
    Ok(args)
  }

  /// Lookahead: `ident '='` but not `ident '=='`. The lexer emits `==` as
  /// its own token, so a single token of lookahead suffices.
  fn peek_is_named_arg(&self) -> bool {
    self.peek_nth(1) == Some(TokenKind::Equal)
  }

  fn primary(&mut self) -> Result<Expr<'src>> {
    let start = self.span();
    match self.kind() {
      Some(TokenKind::Num) => {
        let text = self.lexeme();
        self.bump();
        if text.contains('.') {
          let v: f64 = text
            .replace('_', "")
            .parse()
            .map_err(|_| Error::syntax("invalid float literal", start))?;
          Ok(Spanned::new(start, ExprKind::Float(v)))
        } else {
          let v: i64 = text
            .replace('_', "")
            .parse()
            .map_err(|_| Error::syntax("invalid integer literal", start))?;
          Ok(Spanned::new(start, ExprKind::Int(v)))
        }
      }
      Some(TokenKind::True) => {
        self.bump();
        Ok(Spanned::new(start, ExprKind::Bool(true)))
      }
      Some(TokenKind::False) => {
        self.bump();
        Ok(Spanned::new(start, ExprKind::Bool(false)))
      }
      Some(TokenKind::Null) => {
        self.bump();
        Ok(Spanned::new(start, ExprKind::Null))
      }
      Some(TokenKind::SelfKw) => {
        self.bump();
        Ok(Spanned::new(start, ExprKind::SelfExpr))
      }
      Some(TokenKind::Super) => {
        self.bump();
        Ok(Spanned::new(start, ExprKind::SuperExpr))
      }
      Some(TokenKind::Str) => {
        let raw = self.lexeme();
        let parts = self.parse_string_literal(raw, start)?;
        self.bump();
        Ok(Spanned::new(start, ExprKind::Str(parts)))
      }
      Some(TokenKind::Ident) => {
        let name = self.ident()?;
        let span = name.span;
        Ok(Spanned::new(span, ExprKind::Ident(name)))
      }
      Some(TokenKind::LParen) => {
        self.bump();
        if self.eat(TokenKind::RParen) {
          return Ok(Spanned::new(start.join(self.prev_span()), ExprKind::Tuple(vec![])));
        }
        let first = self.expr()?;
        if self.eat(TokenKind::Comma) {
          let mut items = vec![first];
          while !self.at(TokenKind::RParen) {
            items.push(self.expr()?);
            if !self.eat(TokenKind::Comma) {
              break;
            }
          }
          let end = self.expect(TokenKind::RParen)?.span;
          return Ok(Spanned::new(start.join(end), ExprKind::Tuple(items)));
        }
        let end = self.expect(TokenKind::RParen)?.span;
        Ok(Spanned::new(start.join(end), ExprKind::Paren(Box::new(first))))
      }
      Some(TokenKind::LBracket) => {
        self.bump();
        let mut items = vec![];
        while !self.at(TokenKind::RBracket) {
          items.push(self.expr()?);
          if !self.eat(TokenKind::Comma) {
            break;
          }
        }
        let end = self.expect(TokenKind::RBracket)?.span;
        Ok(Spanned::new(start.join(end), ExprKind::Array(items)))
      }
      Some(TokenKind::LBrace) => {
        self.bump();
        let mut entries = vec![];
        while !self.at(TokenKind::RBrace) {
          let key = self.expr()?;
          self.expect(TokenKind::Colon)?;
          let value = self.expr()?;
          entries.push((key, value));
          if !self.eat(TokenKind::Comma) {
            break;
          }
        }
        let end = self.expect(TokenKind::RBrace)?.span;
        Ok(Spanned::new(start.join(end), ExprKind::Dict(entries)))
      }
      _ => Err(Error::syntax(
        format!("unexpected token `{}` in expression", self.current_text()),
        start,
      )),
    }
  }

  pub(crate) fn ident(&mut self) -> Result<Ident<'src>> {
    if !self.at(TokenKind::Ident) {
      return Err(Error::syntax(
        format!("expected identifier, found `{}`", self.current_text()),
        self.span(),
      ));
    }
    let span = self.span();
    let text = self.lexeme();
    self.bump();
    Ok(Spanned::new(span, Cow::borrowed(text)))
  }

  /// Splits a raw `Str` token's lexeme into literal/interpolated parts and
  /// recursively parses each `%{...}` segment as its own expression (spec
  /// §4.1, tested by spec §8 property 11).
  fn parse_string_literal(&self, raw: &'src str, span: Span) -> Result<Vec<StrPart<'src>>> {
    let (quote_len, body) = if let Some(rest) = raw.strip_prefix("```") {
      (3, &rest[..rest.len() - 3])
    } else {
      (1, &raw[1..raw.len() - 1])
    };
    let base_offset = span.start + quote_len;

    let mut parts = vec![];
    let mut literal = String::new();
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
      if bytes[i] == b'%' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
        if !literal.is_empty() {
          parts.push(StrPart::Literal(std::mem::take(&mut literal)));
        }
        let expr_start = i + 2;
        let mut depth = 1;
        let mut j = expr_start;
        while j < bytes.len() && depth > 0 {
          match bytes[j] {
            b'{' => depth += 1,
            b'}' => depth -= 1,
            _ => {}
          }
          if depth == 0 {
            break;
          }
          j += 1;
        }
        if depth != 0 {
          return Err(Error::lexical("unterminated string interpolation", span));
        }
        let inner_src = &body[expr_start..j];
        let mut inner_expr = parse_interpolation(inner_src)?;
        shift_expr_span(&mut inner_expr, base_offset + expr_start);
        parts.push(StrPart::Interp(Box::new(inner_expr)));
        i = j + 1;
      } else if bytes[i] == b'\\' && i + 1 < bytes.len() {
        literal.push(unescape(bytes[i + 1]));
        i += 2;
      } else {
        let ch_len = utf8_len(bytes[i]);
        literal.push_str(&body[i..i + ch_len]);
        i += ch_len;
      }
    }
    if !literal.is_empty() || parts.is_empty() {
      parts.push(StrPart::Literal(literal));
    }
    Ok(parts)
  }

  /// Span of the token just consumed, used to close out call/attr spans
  /// (and, from the sibling `stmt` module, statement spans).
  pub(super) fn prev_span(&self) -> Span {
    self.tokens[self.pos - 1].span
  }

  /// Lookahead `n` tokens past the current one, `None` past EOF.
  fn peek_nth(&self, n: usize) -> Option<TokenKind> {
    self.tokens.get(self.pos + n).map(|tok| tok.kind)
  }
}

fn unescape(c: u8) -> char {
  match c {
    b'n' => '\n',
    b't' => '\t',
    b'\\' => '\\',
    b'\'' => '\'',
    b'"' => '"',
    other => other as char,
  }
}

fn utf8_len(byte: u8) -> usize {
  if byte & 0x80 == 0 {
    1
  } else if byte & 0xE0 == 0xC0 {
    2
  } else if byte & 0xF0 == 0xE0 {
    3
  } else {
    4
  }
}

fn parse_interpolation<'src>(src: &'src str) -> Result<Expr<'src>> {
  let lexer = crate::lexer::Lexer::lex(src)
    .map_err(|mut errs| errs.drain(..).next().expect("lex error list is never empty"))?;
  let mut sub = Parser {
    src,
    tokens: lexer.tokens,
    pos: 0,
    eof: lexer.eof,
  };
  let expr = sub.expr()?;
  if !sub.is_eof() {
    return Err(Error::syntax("trailing tokens in string interpolation", sub.span()));
  }
  Ok(expr)
}

/// Shift every span in `expr` (including nested subexpressions) by `delta`,
/// remapping spans produced while parsing a `%{...}` interpolation segment
/// in isolation back into the coordinates of the original source file.
fn shift_expr_span(expr: &mut Expr<'_>, delta: usize) {
  expr.span = Span {
    start: expr.span.start + delta,
    end: expr.span.end + delta,
  };
  match &mut **expr {
    ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Bool(_) | ExprKind::Null | ExprKind::SelfExpr | ExprKind::SuperExpr => {}
    ExprKind::Str(parts) => {
      for part in parts {
        if let StrPart::Interp(e) = part {
          shift_expr_span(e, delta);
        }
      }
    }
    ExprKind::Array(items) | ExprKind::Tuple(items) => {
      for item in items {
        shift_expr_span(item, delta);
      }
    }
    ExprKind::Dict(entries) => {
      for (k, v) in entries {
        shift_expr_span(k, delta);
        shift_expr_span(v, delta);
      }
    }
    ExprKind::Ident(name) => shift_ident_span(name, delta),
    ExprKind::Paren(inner) | ExprKind::Await(inner) | ExprKind::Unary(_, inner) => {
      shift_expr_span(inner, delta)
    }
    ExprKind::Cond(a, b, c) => {
      shift_expr_span(a, delta);
      shift_expr_span(b, delta);
      shift_expr_span(c, delta);
    }
    ExprKind::Logical(_, a, b) | ExprKind::Binary(_, a, b) => {
      shift_expr_span(a, delta);
      shift_expr_span(b, delta);
    }
    ExprKind::Call(callee, args) => {
      shift_expr_span(callee, delta);
      for a in &mut args.positional {
        shift_expr_span(a, delta);
      }
      for (name, a) in &mut args.named {
        shift_ident_span(name, delta);
        shift_expr_span(a, delta);
      }
    }
    ExprKind::Index(base, index, _) => {
      shift_expr_span(base, delta);
      shift_expr_span(index, delta);
    }
    ExprKind::Attr(base, name, _) => {
      shift_expr_span(base, delta);
      shift_ident_span(name, delta);
    }
  }
}

fn shift_ident_span(ident: &mut Ident<'_>, delta: usize) {
  ident.span = Span {
    start: ident.span.start + delta,
    end: ident.span.end + delta,
  };
}
