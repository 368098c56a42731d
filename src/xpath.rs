//! レンダリング済み HTML スナップショット向けの XPath サブセット
//!
//! ブラウザ上では `document.evaluate` がそのまま使えるが、抽出エンジンは
//! 静的スナップショットしか読まないため、サイトプロファイルで実際に使う
//! 範囲の XPath をここで評価する。
//!
//! 対応範囲:
//! - 軸: child, descendant, descendant-or-self, parent, ancestor,
//!   ancestor-or-self, self, following-sibling, preceding-sibling
//! - 省略形: `/`, `//`, `.`, `..`, `*`, `node()`
//! - 述語: `@attr`, `text()`, `.`, `contains()`, `starts-with()`,
//!   `normalize-space()`, `not()`, `position()`, `last()`, 数値位置,
//!   `=`, `!=`, `and`, `or`, 子要素名
//! - `(path)[n]` 形式のグループ化

use std::collections::HashSet;

use scraper::{ElementRef, Html};

use crate::error::ScraperError;

/// 解析済みのパス式
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    steps: Vec<Step>,
    /// `(path)[n]` のグループ全体に掛かる述語
    group_predicates: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Parent,
    Ancestor,
    AncestorOrSelf,
    SelfAxis,
    FollowingSibling,
    PrecedingSibling,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    AnyElement,
    AnyNode,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Contains(Box<Expr>, Box<Expr>),
    StartsWith(Box<Expr>, Box<Expr>),
    NormalizeSpace(Box<Expr>),
    Attr(String),
    OwnText,
    Context,
    Child(String),
    Literal(String),
    Number(f64),
    Position,
    Last,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    At,
    Dot,
    DotDot,
    Star,
    ColonColon,
    Name(String),
    Literal(String),
    Number(f64),
}

fn invalid(expr: &str, reason: impl std::fmt::Display) -> ScraperError {
    ScraperError::config(format!("XPath '{}' を解釈できません: {}", expr, reason))
}

fn tokenize(src: &str) -> Result<Vec<Token>, ScraperError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    tokens.push(Token::DoubleSlash);
                    i += 2;
                } else {
                    tokens.push(Token::Slash);
                    i += 1;
                }
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '@' => {
                tokens.push(Token::At);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                tokens.push(Token::ColonColon);
                i += 2;
            }
            '.' => {
                if chars.get(i + 1) == Some(&'.') {
                    tokens.push(Token::DotDot);
                    i += 2;
                } else {
                    tokens.push(Token::Dot);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|p| start + p)
                    .ok_or_else(|| invalid(src, "文字列リテラルが閉じていません"))?;
                tokens.push(Token::Literal(chars[start..end].iter().collect()));
                i = end + 1;
            }
            d if d.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| invalid(src, format!("数値 '{}'", text)))?;
                tokens.push(Token::Number(n));
            }
            a if a.is_alphabetic() || a == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '-' || chars[i] == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(src, format!("予期しない文字 '{}'", other))),
        }
    }

    Ok(tokens)
}

struct Parser<'s> {
    src: &'s str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'s> Parser<'s> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: Token) -> Result<(), ScraperError> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            other => Err(invalid(
                self.src,
                format!("{:?} が必要ですが {:?} でした", expected, other),
            )),
        }
    }

    fn parse_top(&mut self) -> Result<PathExpr, ScraperError> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let steps = self.parse_path()?;
            self.expect(Token::RParen)?;
            let group_predicates = self.parse_predicates()?;
            return Ok(PathExpr {
                steps,
                group_predicates,
            });
        }

        Ok(PathExpr {
            steps: self.parse_path()?,
            group_predicates: Vec::new(),
        })
    }

    fn parse_path(&mut self) -> Result<Vec<Step>, ScraperError> {
        let mut steps = Vec::new();

        match self.peek() {
            Some(Token::Slash) => {
                self.next();
            }
            Some(Token::DoubleSlash) => {
                self.next();
                steps.push(descendant_or_self());
            }
            _ => {}
        }

        steps.push(self.parse_step()?);

        loop {
            match self.peek() {
                Some(Token::Slash) => {
                    self.next();
                }
                Some(Token::DoubleSlash) => {
                    self.next();
                    steps.push(descendant_or_self());
                }
                _ => break,
            }
            steps.push(self.parse_step()?);
        }

        Ok(steps)
    }

    fn parse_step(&mut self) -> Result<Step, ScraperError> {
        match self.peek() {
            Some(Token::Dot) => {
                self.next();
                return Ok(Step {
                    axis: Axis::SelfAxis,
                    test: NodeTest::AnyNode,
                    predicates: Vec::new(),
                });
            }
            Some(Token::DotDot) => {
                self.next();
                return Ok(Step {
                    axis: Axis::Parent,
                    test: NodeTest::AnyNode,
                    predicates: Vec::new(),
                });
            }
            _ => {}
        }

        let mut axis = Axis::Child;
        if let (Some(Token::Name(name)), Some(Token::ColonColon)) = (self.peek(), self.peek_at(1)) {
            axis = match name.as_str() {
                "child" => Axis::Child,
                "descendant" => Axis::Descendant,
                "descendant-or-self" => Axis::DescendantOrSelf,
                "parent" => Axis::Parent,
                "ancestor" => Axis::Ancestor,
                "ancestor-or-self" => Axis::AncestorOrSelf,
                "self" => Axis::SelfAxis,
                "following-sibling" => Axis::FollowingSibling,
                "preceding-sibling" => Axis::PrecedingSibling,
                other => return Err(invalid(self.src, format!("未対応の軸 '{}'", other))),
            };
            self.next();
            self.next();
        }

        let test = match self.next() {
            Some(Token::Star) => NodeTest::AnyElement,
            Some(Token::Name(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    self.expect(Token::RParen)?;
                    match name.as_str() {
                        "node" => NodeTest::AnyNode,
                        other => {
                            return Err(invalid(
                                self.src,
                                format!("ステップでは {}() を選択できません", other),
                            ))
                        }
                    }
                } else {
                    NodeTest::Name(name.to_ascii_lowercase())
                }
            }
            Some(Token::At) => {
                return Err(invalid(self.src, "属性ノードは選択できません"));
            }
            other => return Err(invalid(self.src, format!("ステップが必要です: {:?}", other))),
        };

        Ok(Step {
            axis,
            test,
            predicates: self.parse_predicates()?,
        })
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>, ScraperError> {
        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.next();
            predicates.push(self.parse_or()?);
            self.expect(Token::RBracket)?;
        }
        Ok(predicates)
    }

    fn parse_or(&mut self) -> Result<Expr, ScraperError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Name(n)) if n == "or") {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ScraperError> {
        let mut lhs = self.parse_cmp()?;
        while matches!(self.peek(), Some(Token::Name(n)) if n == "and") {
            self.next();
            let rhs = self.parse_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ScraperError> {
        let lhs = self.parse_primary()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.next();
                Ok(Expr::Eq(Box::new(lhs), Box::new(self.parse_primary()?)))
            }
            Some(Token::Ne) => {
                self.next();
                Ok(Expr::Ne(Box::new(lhs), Box::new(self.parse_primary()?)))
            }
            _ => Ok(lhs),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ScraperError> {
        match self.next() {
            Some(Token::Literal(s)) => Ok(Expr::Literal(s)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Dot) => Ok(Expr::Context),
            Some(Token::At) => match self.next() {
                Some(Token::Name(name)) => Ok(Expr::Attr(name.to_ascii_lowercase())),
                other => Err(invalid(self.src, format!("属性名が必要です: {:?}", other))),
            },
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Child(name.to_ascii_lowercase()));
                }
                self.next();
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    args.push(self.parse_or()?);
                    while self.peek() == Some(&Token::Comma) {
                        self.next();
                        args.push(self.parse_or()?);
                    }
                }
                self.expect(Token::RParen)?;
                self.function(&name, args)
            }
            other => Err(invalid(self.src, format!("式が必要です: {:?}", other))),
        }
    }

    fn function(&self, name: &str, mut args: Vec<Expr>) -> Result<Expr, ScraperError> {
        let arity = args.len();
        let wrong_arity = || invalid(self.src, format!("{}() の引数の数が不正です ({})", name, arity));

        match name {
            "text" if arity == 0 => Ok(Expr::OwnText),
            "position" if arity == 0 => Ok(Expr::Position),
            "last" if arity == 0 => Ok(Expr::Last),
            "not" if arity == 1 => Ok(Expr::Not(Box::new(args.remove(0)))),
            "normalize-space" if arity == 0 => Ok(Expr::NormalizeSpace(Box::new(Expr::Context))),
            "normalize-space" if arity == 1 => {
                Ok(Expr::NormalizeSpace(Box::new(args.remove(0))))
            }
            "contains" | "starts-with" if arity == 2 => {
                let needle = args.remove(1);
                let haystack = args.remove(0);
                if name == "contains" {
                    Ok(Expr::Contains(Box::new(haystack), Box::new(needle)))
                } else {
                    Ok(Expr::StartsWith(Box::new(haystack), Box::new(needle)))
                }
            }
            "text" | "position" | "last" | "not" | "normalize-space" | "contains"
            | "starts-with" => Err(wrong_arity()),
            other => Err(invalid(self.src, format!("未対応の関数 '{}()'", other))),
        }
    }
}

fn descendant_or_self() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::AnyNode,
        predicates: Vec::new(),
    }
}

impl PathExpr {
    /// パス式を解析する。未対応の構文は `ConfigError`
    pub fn parse(src: &str) -> Result<Self, ScraperError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(invalid(src, "空の式"));
        }
        let mut parser = Parser {
            src,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_top()?;
        if parser.pos < parser.tokens.len() {
            return Err(invalid(
                src,
                format!("末尾に余分なトークン: {:?}", &parser.tokens[parser.pos..]),
            ));
        }
        Ok(expr)
    }

    /// ドキュメント順 (軸順) で一致した要素を返す
    pub fn select<'a>(&self, html: &'a Html) -> Vec<ElementRef<'a>> {
        let mut contexts = vec![Ctx::Doc(html)];

        for step in &self.steps {
            let mut seen = HashSet::new();
            let mut next = Vec::new();

            for ctx in &contexts {
                let mut candidates: Vec<Ctx<'a>> = axis_nodes(*ctx, step.axis)
                    .into_iter()
                    .filter(|c| node_test(c, &step.test))
                    .collect();

                for predicate in &step.predicates {
                    candidates = filter_by(candidates, predicate);
                }

                for c in candidates {
                    if seen.insert(c.key()) {
                        next.push(c);
                    }
                }
            }

            contexts = next;
        }

        for predicate in &self.group_predicates {
            contexts = filter_by(contexts, predicate);
        }

        contexts
            .into_iter()
            .filter_map(|c| match c {
                Ctx::El(el) => Some(el),
                Ctx::Doc(_) => None,
            })
            .collect()
    }
}

/// 評価コンテキスト。ドキュメントノード自体も扱う
#[derive(Clone, Copy)]
enum Ctx<'a> {
    Doc(&'a Html),
    El(ElementRef<'a>),
}

impl<'a> Ctx<'a> {
    fn key(&self) -> Option<impl std::hash::Hash + Eq> {
        match self {
            Ctx::Doc(_) => None,
            Ctx::El(el) => Some(el.id()),
        }
    }

    fn full_text(&self) -> String {
        match self {
            Ctx::Doc(html) => collapse(&html.root_element().text().collect::<String>()),
            Ctx::El(el) => collapse(&el.text().collect::<String>()),
        }
    }

    fn own_text(&self) -> String {
        match self {
            Ctx::Doc(_) => String::new(),
            Ctx::El(el) => {
                let mut out = String::new();
                for child in el.children() {
                    if let Some(text) = child.value().as_text() {
                        out.push_str(&text.text);
                    }
                }
                collapse(&out)
            }
        }
    }

    fn attr(&self, name: &str) -> Option<String> {
        match self {
            Ctx::Doc(_) => None,
            Ctx::El(el) => el.value().attr(name).map(str::to_string),
        }
    }

    fn has_child(&self, name: &str) -> bool {
        axis_nodes(*self, Axis::Child)
            .iter()
            .any(|c| node_test(c, &NodeTest::Name(name.to_string())))
    }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn axis_nodes<'a>(ctx: Ctx<'a>, axis: Axis) -> Vec<Ctx<'a>> {
    match (ctx, axis) {
        (Ctx::Doc(html), Axis::Child) => vec![Ctx::El(html.root_element())],
        (Ctx::Doc(html), Axis::Descendant) => all_elements(html),
        (Ctx::Doc(html), Axis::DescendantOrSelf) => {
            let mut out = vec![ctx];
            out.extend(all_elements(html));
            out
        }
        (Ctx::Doc(_), Axis::SelfAxis) => vec![ctx],
        (Ctx::Doc(_), _) => Vec::new(),
        (Ctx::El(el), Axis::Child) => el
            .children()
            .filter_map(ElementRef::wrap)
            .map(Ctx::El)
            .collect(),
        (Ctx::El(el), Axis::Descendant) => el
            .descendants()
            .skip(1)
            .filter_map(ElementRef::wrap)
            .map(Ctx::El)
            .collect(),
        (Ctx::El(el), Axis::DescendantOrSelf) => el
            .descendants()
            .filter_map(ElementRef::wrap)
            .map(Ctx::El)
            .collect(),
        (Ctx::El(el), Axis::Parent) => el
            .parent()
            .and_then(ElementRef::wrap)
            .map(Ctx::El)
            .into_iter()
            .collect(),
        (Ctx::El(el), Axis::Ancestor) => el
            .ancestors()
            .filter_map(ElementRef::wrap)
            .map(Ctx::El)
            .collect(),
        (Ctx::El(el), Axis::AncestorOrSelf) => {
            let mut out = vec![ctx];
            out.extend(el.ancestors().filter_map(ElementRef::wrap).map(Ctx::El));
            out
        }
        (Ctx::El(_), Axis::SelfAxis) => vec![ctx],
        (Ctx::El(el), Axis::FollowingSibling) => el
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .map(Ctx::El)
            .collect(),
        (Ctx::El(el), Axis::PrecedingSibling) => el
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .map(Ctx::El)
            .collect(),
    }
}

fn all_elements(html: &Html) -> Vec<Ctx<'_>> {
    html.root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .map(Ctx::El)
        .collect()
}

fn node_test(ctx: &Ctx<'_>, test: &NodeTest) -> bool {
    match (ctx, test) {
        (_, NodeTest::AnyNode) => true,
        (Ctx::Doc(_), _) => false,
        (Ctx::El(_), NodeTest::AnyElement) => true,
        (Ctx::El(el), NodeTest::Name(name)) => el.value().name().eq_ignore_ascii_case(name),
    }
}

fn filter_by<'a>(candidates: Vec<Ctx<'a>>, predicate: &Expr) -> Vec<Ctx<'a>> {
    let size = candidates.len();
    candidates
        .into_iter()
        .enumerate()
        .filter(|(i, c)| {
            let value = eval(predicate, c, i + 1, size);
            match value {
                // [n] は position() = n の省略形
                Value::Num(n) => (n - (i + 1) as f64).abs() < f64::EPSILON,
                other => other.truthy(),
            }
        })
        .map(|(_, c)| c)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
    /// 属性・子要素など、存在判定と文字列値の両方を持つもの
    Node(Option<String>),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Node(n) => n.is_some(),
        }
    }

    fn string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Str(s) => s.clone(),
            Value::Node(n) => n.clone().unwrap_or_default(),
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            other => other.string().trim().parse().ok(),
        }
    }
}

fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Num(_), _) | (_, Value::Num(_)) => match (a.number(), b.number()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => false,
        },
        (Value::Bool(_), _) | (_, Value::Bool(_)) => a.truthy() == b.truthy(),
        _ => a.string() == b.string(),
    }
}

fn eval(expr: &Expr, ctx: &Ctx<'_>, position: usize, size: usize) -> Value {
    match expr {
        Expr::Or(a, b) => Value::Bool(
            eval(a, ctx, position, size).truthy() || eval(b, ctx, position, size).truthy(),
        ),
        Expr::And(a, b) => Value::Bool(
            eval(a, ctx, position, size).truthy() && eval(b, ctx, position, size).truthy(),
        ),
        Expr::Eq(a, b) => Value::Bool(equals(
            &eval(a, ctx, position, size),
            &eval(b, ctx, position, size),
        )),
        Expr::Ne(a, b) => Value::Bool(!equals(
            &eval(a, ctx, position, size),
            &eval(b, ctx, position, size),
        )),
        Expr::Not(a) => Value::Bool(!eval(a, ctx, position, size).truthy()),
        Expr::Contains(h, n) => {
            let haystack = eval(h, ctx, position, size).string();
            let needle = eval(n, ctx, position, size).string();
            Value::Bool(haystack.contains(&needle))
        }
        Expr::StartsWith(h, n) => {
            let haystack = eval(h, ctx, position, size).string();
            let needle = eval(n, ctx, position, size).string();
            Value::Bool(haystack.starts_with(&needle))
        }
        Expr::NormalizeSpace(a) => Value::Str(collapse(&eval(a, ctx, position, size).string())),
        Expr::Attr(name) => Value::Node(ctx.attr(name)),
        Expr::OwnText => Value::Str(ctx.own_text()),
        Expr::Context => Value::Str(ctx.full_text()),
        Expr::Child(name) => {
            if ctx.has_child(name) {
                Value::Node(Some(String::new()))
            } else {
                Value::Node(None)
            }
        }
        Expr::Literal(s) => Value::Str(s.clone()),
        Expr::Number(n) => Value::Num(*n),
        Expr::Position => Value::Num(position as f64),
        Expr::Last => Value::Num(size as f64),
    }
}
