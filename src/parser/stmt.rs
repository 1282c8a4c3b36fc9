//! Statement grammar (spec §4.5).
//!
//! Every statement header follows one of two shapes, both confirmed by the
//! lexer's own fixture (`let: x = 1:` → `Let Colon Ident Equal Num Colon`):
//! keywords that carry their own expression content wrap it in a leading
//! *and* a trailing colon (`let: <target> = <expr>:`, `if: <cond>:`,
//! `raise: <expr>:`); keywords that carry no expression of their own
//! (`break:`, `catch [as name]:`, `else:`, `finally:`) end in a single
//! colon with nothing in front of it.

use span::Spanned;

use super::Parser;
use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::TokenKind;

impl<'src> Parser<'src> {
  pub(crate) fn stmt(&mut self) -> Result<Stmt<'src>> {
    let indent = self.ws();
    let start = self.span();
    match self.kind() {
      Some(TokenKind::Let) => self.let_stmt(start),
      Some(TokenKind::If) => self.if_stmt(start, indent),
      Some(TokenKind::Loop) => self.loop_stmt(start, indent),
      Some(TokenKind::Break) => {
        self.bump();
        self.expect(TokenKind::Colon)?;
        Ok(Spanned::new(start.join(self.prev_span()), StmtKind::Break))
      }
      Some(TokenKind::Continue) => {
        self.bump();
        self.expect(TokenKind::Colon)?;
        Ok(Spanned::new(start.join(self.prev_span()), StmtKind::Continue))
      }
      Some(TokenKind::Skip) => {
        self.bump();
        self.expect(TokenKind::Colon)?;
        Ok(Spanned::new(start.join(self.prev_span()), StmtKind::Skip))
      }
      Some(TokenKind::Raise) => {
        self.bump();
        self.expect(TokenKind::Colon)?;
        let value = self.expr()?;
        self.expect(TokenKind::Colon)?;
        Ok(Spanned::new(
          start.join(self.prev_span()),
          StmtKind::Raise(Box::new(value)),
        ))
      }
      Some(TokenKind::Return) => {
        self.bump();
        self.expect(TokenKind::Colon)?;
        let mut values = vec![];
        if !self.at(TokenKind::Colon) {
          values.push(self.expr()?);
          while self.eat(TokenKind::Comma) {
            values.push(self.expr()?);
          }
        }
        self.expect(TokenKind::Colon)?;
        Ok(Spanned::new(start.join(self.prev_span()), StmtKind::Return(values)))
      }
      Some(TokenKind::Try) => self.try_stmt(start, indent),
      Some(TokenKind::Async) | Some(TokenKind::Funct) => self.func_stmt(start, indent),
      Some(TokenKind::Blueprint) => self.blueprint_stmt(start, indent),
      Some(TokenKind::Load) => self.load_stmt(start),
      None => Err(Error::syntax("unexpected end of input", start)),
      _ => {
        let value = self.expr()?;
        self.expect(TokenKind::Colon)?;
        Ok(Spanned::new(
          start.join(self.prev_span()),
          StmtKind::Expr(Box::new(value)),
        ))
      }
    }
  }

  fn let_stmt(&mut self, start: span::Span) -> Result<Stmt<'src>> {
    self.bump(); // `let`
    self.expect(TokenKind::Colon)?;
    let target = self.target()?;
    self.expect(TokenKind::Equal)?;
    let value = self.expr()?;
    self.expect(TokenKind::Colon)?;
    Ok(Spanned::new(
      start.join(self.prev_span()),
      StmtKind::Let(Box::new(Let { target, value })),
    ))
  }

  /// The left-hand side of a `let:`: a bare identifier, an attribute
  /// (`obj.attr`), or a chain of indices (`target[i]…[j]`, spec §4.5's
  /// `try_get_value_ptr` traversal). A trailing `.attr` is always the
  /// target; a run of `[...]` is consumed in full as the index chain.
  fn target(&mut self) -> Result<Target<'src>> {
    let name = self.ident()?;
    if !(self.at(TokenKind::Dot) || self.at(TokenKind::LBracket)) {
      return Ok(Target::Ident(name));
    }

    let mut base = Spanned::new(name.span, ExprKind::Ident(name));
    loop {
      if self.at(TokenKind::LBracket) {
        let mut indices = vec![self.bracket_index()?];
        while self.at(TokenKind::LBracket) {
          indices.push(self.bracket_index()?);
        }
        return Ok(Target::Index(Box::new(base), indices));
      } else if self.eat(TokenKind::Dot) {
        let attr = self.ident()?;
        if self.at(TokenKind::Equal) {
          return Ok(Target::Attr(Box::new(base), attr));
        }
        let span = base.span.join(attr.span);
        base = Spanned::new(span, ExprKind::Attr(Box::new(base), attr, false));
      } else {
        return Err(Error::syntax("invalid assignment target", self.span()));
      }
    }
  }

  fn bracket_index(&mut self) -> Result<Expr<'src>> {
    self.expect(TokenKind::LBracket)?;
    let index = self.expr()?;
    self.expect(TokenKind::RBracket)?;
    Ok(index)
  }

  fn if_stmt(&mut self, start: span::Span, indent: usize) -> Result<Stmt<'src>> {
    self.bump(); // `if`
    self.expect(TokenKind::Colon)?;
    let cond = self.expr()?;
    let header_end = self.expect(TokenKind::Colon)?.span.end;
    let then = self.block(header_end, indent)?;

    let mut elifs = vec![];
    while self.at(TokenKind::Elif) {
      self.bump();
      self.expect(TokenKind::Colon)?;
      let elif_cond = self.expr()?;
      let elif_header_end = self.expect(TokenKind::Colon)?.span.end;
      let elif_body = self.block(elif_header_end, indent)?;
      elifs.push((elif_cond, elif_body));
    }

    let else_ = if self.at(TokenKind::Else) {
      self.bump();
      let else_header_end = self.expect(TokenKind::Colon)?.span.end;
      Some(self.block(else_header_end, indent)?)
    } else {
      None
    };

    Ok(Spanned::new(
      start.join(self.prev_span()),
      StmtKind::If(Box::new(If { cond, then, elifs, else_ })),
    ))
  }

  fn loop_stmt(&mut self, start: span::Span, indent: usize) -> Result<Stmt<'src>> {
    self.bump(); // `loop`
    self.expect(TokenKind::Colon)?;

    let kind = if self.eat(TokenKind::While) {
      let cond = self.expr()?;
      let header_end = self.expect(TokenKind::Colon)?.span.end;
      let body = self.block(header_end, indent)?;
      LoopStmt::While(WhileLoop { cond, body })
    } else if self.eat(TokenKind::For) {
      let var = self.ident()?;
      if self.eat(TokenKind::From) {
        let start_expr = self.expr()?;
        self.expect(TokenKind::To)?;
        let end_expr = self.expr()?;
        let step = if self.eat(TokenKind::Step) {
          Some(self.expr()?)
        } else {
          None
        };
        let header_end = self.expect(TokenKind::Colon)?.span.end;
        let body = self.block(header_end, indent)?;
        LoopStmt::ForRange(ForRangeLoop {
          var,
          start: start_expr,
          end: end_expr,
          step,
          body,
        })
      } else if self.eat(TokenKind::In) {
        let iter = self.expr()?;
        let header_end = self.expect(TokenKind::Colon)?.span.end;
        let body = self.block(header_end, indent)?;
        LoopStmt::ForIn(ForInLoop { var, iter, body })
      } else {
        return Err(Error::syntax("expected `from` or `in` after `for <name>`", self.span()));
      }
    } else {
      return Err(Error::syntax("expected `while` or `for` after `loop:`", self.span()));
    };

    Ok(Spanned::new(start.join(self.prev_span()), StmtKind::Loop(Box::new(kind))))
  }

  fn try_stmt(&mut self, start: span::Span, indent: usize) -> Result<Stmt<'src>> {
    self.bump(); // `try`
    let header_end = self.expect(TokenKind::Colon)?.span.end;
    let body = self.block(header_end, indent)?;

    let catch = if self.at(TokenKind::Catch) {
      self.bump();
      let name = if self.eat(TokenKind::As) {
        Some(self.ident()?)
      } else {
        None
      };
      let catch_header_end = self.expect(TokenKind::Colon)?.span.end;
      let catch_body = self.block(catch_header_end, indent)?;
      Some(Catch { name, body: catch_body })
    } else {
      None
    };

    let finally = if self.at(TokenKind::Finally) {
      self.bump();
      let finally_header_end = self.expect(TokenKind::Colon)?.span.end;
      Some(self.block(finally_header_end, indent)?)
    } else {
      None
    };

    if catch.is_none() && finally.is_none() {
      return Err(Error::syntax(
        "a `try:` block requires a `catch:` and/or a `finally:`",
        start,
      ));
    }

    Ok(Spanned::new(
      start.join(self.prev_span()),
      StmtKind::Try(Box::new(Try { body, catch, finally })),
    ))
  }

  fn func_stmt(&mut self, start: span::Span, indent: usize) -> Result<Stmt<'src>> {
    let is_async = self.eat(TokenKind::Async);
    self.expect(TokenKind::Funct)?;
    self.expect(TokenKind::Colon)?;
    let name = self.ident()?;
    let params = self.params()?;
    let header_end = self.expect(TokenKind::Colon)?.span.end;
    let body = self.block(header_end, indent)?;
    Ok(Spanned::new(
      start.join(self.prev_span()),
      StmtKind::Func(Box::new(FuncDecl { name, params, body, is_async })),
    ))
  }

  fn params(&mut self) -> Result<Params<'src>> {
    self.expect(TokenKind::LParen)?;
    let mut params = vec![];
    while !self.at(TokenKind::RParen) {
      let name = self.ident()?;
      let default = if self.eat(TokenKind::Equal) {
        Some(self.expr()?)
      } else {
        None
      };
      params.push(Param { name, default });
      if !self.eat(TokenKind::Comma) {
        break;
      }
    }
    self.expect(TokenKind::RParen)?;
    Ok(Params { params })
  }

  fn blueprint_stmt(&mut self, start: span::Span, indent: usize) -> Result<Stmt<'src>> {
    self.bump(); // `blueprint`
    self.expect(TokenKind::Colon)?;
    let name = self.ident()?;
    let parent = if self.eat(TokenKind::Inherits) {
      Some(self.ident()?)
    } else {
      None
    };
    let header_end = self.expect(TokenKind::Colon)?.span.end;
    let members = self.block(header_end, indent)?;

    let mut attrs = vec![];
    let mut methods = vec![];
    for member in members {
      let span = member.span;
      match member.into_inner() {
        StmtKind::Let(let_) => attrs.push(*let_),
        StmtKind::Func(func) => methods.push(*func),
        _ => {
          return Err(Error::syntax(
            "a `blueprint:` body may only contain `let:` and `funct:` statements",
            span,
          ));
        }
      }
    }

    Ok(Spanned::new(
      start.join(self.prev_span()),
      StmtKind::Blueprint(Box::new(BlueprintDecl { name, parent, attrs, methods })),
    ))
  }

  fn load_stmt(&mut self, start: span::Span) -> Result<Stmt<'src>> {
    self.bump(); // `load`
    self.expect(TokenKind::Colon)?;

    if self.eat(TokenKind::LParen) {
      let mut names = vec![];
      while !self.at(TokenKind::RParen) {
        let name = self.ident()?;
        let alias = if self.eat(TokenKind::As) {
          Some(self.ident()?)
        } else {
          None
        };
        names.push((name, alias));
        if !self.eat(TokenKind::Comma) {
          break;
        }
      }
      self.expect(TokenKind::RParen)?;
      self.expect(TokenKind::From)?;
      let path = self.ident()?;
      self.expect(TokenKind::Colon)?;
      Ok(Spanned::new(
        start.join(self.prev_span()),
        StmtKind::Load(Box::new(Load::Names { names, path })),
      ))
    } else {
      let path = self.ident()?;
      let alias = if self.eat(TokenKind::As) {
        Some(self.ident()?)
      } else {
        None
      };
      self.expect(TokenKind::Colon)?;
      Ok(Spanned::new(
        start.join(self.prev_span()),
        StmtKind::Load(Box::new(Load::Module { path, alias })),
      ))
    }
  }
}
