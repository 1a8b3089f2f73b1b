/*
 * Copyright (c) 2021 gematik GmbH
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *    http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::collections::HashSet;

use super::{Document, Error, NodeId, NodeKind};

/// Compiled XPath expression.
///
/// Covers the XPath 1.0 subset used for signature and encryption filters:
/// location paths over the `self`, `child`, `parent`, `ancestor[-or-self]`,
/// `descendant[-or-self]` and `attribute` axes, name and node type tests,
/// predicates testing path existence or string equality, path unions and
/// the `here()` function.
#[derive(Debug, Clone)]
pub struct XPath {
    paths: Vec<Path>,
}

/// Evaluation context for a compiled [`XPath`].
#[derive(Default)]
pub struct XPathContext<'a> {
    /// Context node for relative paths. Defaults to the document node.
    pub node: Option<NodeId>,
    /// The attribute node returned by `here()`.
    pub here: Option<Here>,
    /// Prefix bindings for name tests.
    pub namespaces: &'a [(String, String)],
}

#[derive(Debug, Clone)]
pub struct Here {
    pub element: NodeId,
    pub attr: String,
}

#[derive(Debug, Clone)]
struct Path {
    start: PathStart,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
enum PathStart {
    Context,
    Root,
    Here,
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NodeTest,
    preds: Vec<Pred>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    SelfAxis,
    Child,
    Parent,
    Ancestor,
    AncestorOrSelf,
    Descendant,
    DescendantOrSelf,
    Attribute,
}

#[derive(Debug, Clone)]
enum NodeTest {
    Name(Option<String>, String),
    AnyName,
    Text,
    Comment,
    AnyNode,
}

#[derive(Debug, Clone)]
struct Pred {
    path: Path,
    equals: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Value {
    Node(NodeId),
    Attr(NodeId, String),
}

impl XPath {
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser { tokens, pos: 0 };

        let mut paths = vec![parser.path()?];
        while parser.eat(&Token::Pipe) {
            paths.push(parser.path()?);
        }

        if parser.pos != parser.tokens.len() {
            return Err(Error::XPathSyntax(format!(
                "trailing input in expression '{}'",
                expr
            )));
        }

        Ok(Self { paths })
    }

    /// Evaluates the expression and returns the selected element, text,
    /// comment and PI nodes in first-seen order.
    pub fn eval(&self, doc: &Document, ctx: &XPathContext) -> Result<Vec<NodeId>, Error> {
        let mut ret = Vec::new();
        let mut seen = HashSet::new();

        for path in &self.paths {
            for value in eval_path(doc, path, ctx)? {
                if let Value::Node(node) = value {
                    if seen.insert(node) {
                        ret.push(node);
                    }
                }
            }
        }

        Ok(ret)
    }

    /// Boolean result with `node` as the context node: true if the
    /// expression selects anything.
    pub fn matches(&self, doc: &Document, node: NodeId, ctx: &XPathContext) -> Result<bool, Error> {
        let ctx = XPathContext {
            node: Some(node),
            here: ctx.here.clone(),
            namespaces: ctx.namespaces,
        };

        for path in &self.paths {
            if !eval_path(doc, path, &ctx)?.is_empty() {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/* Evaluation */

fn eval_path(doc: &Document, path: &Path, ctx: &XPathContext) -> Result<Vec<Value>, Error> {
    let mut values = match path.start {
        PathStart::Context => vec![Value::Node(ctx.node.unwrap_or_else(|| doc.root()))],
        PathStart::Root => vec![Value::Node(doc.root())],
        PathStart::Here => match &ctx.here {
            Some(here) => vec![Value::Attr(here.element, here.attr.clone())],
            None => {
                return Err(Error::XPathEval(
                    "here() is not available in this context".into(),
                ))
            }
        },
    };

    for step in &path.steps {
        let mut next = Vec::new();
        let mut seen = HashSet::new();

        for value in &values {
            for candidate in axis_values(doc, value, step.axis) {
                if !test_matches(doc, &candidate, &step.test, ctx) {
                    continue;
                }

                if !preds_match(doc, &candidate, &step.preds, ctx)? {
                    continue;
                }

                if seen.insert(candidate.clone()) {
                    next.push(candidate);
                }
            }
        }

        values = next;
    }

    Ok(values)
}

fn axis_values(doc: &Document, value: &Value, axis: Axis) -> Vec<Value> {
    match value {
        Value::Node(node) => {
            let node = *node;

            match axis {
                Axis::SelfAxis => vec![Value::Node(node)],
                Axis::Child => doc.children(node).iter().map(|c| Value::Node(*c)).collect(),
                Axis::Parent => doc.parent(node).map(Value::Node).into_iter().collect(),
                Axis::Ancestor => {
                    let mut ret = Vec::new();
                    let mut current = doc.parent(node);
                    while let Some(n) = current {
                        ret.push(Value::Node(n));
                        current = doc.parent(n);
                    }

                    ret
                }
                Axis::AncestorOrSelf => {
                    let mut ret = vec![Value::Node(node)];
                    ret.extend(axis_values(doc, value, Axis::Ancestor));

                    ret
                }
                Axis::Descendant => {
                    let mut ret = doc.descendants(node);
                    ret.retain(|n| *n != node);

                    ret.into_iter().map(Value::Node).collect()
                }
                Axis::DescendantOrSelf => {
                    doc.descendants(node).into_iter().map(Value::Node).collect()
                }
                Axis::Attribute => doc
                    .attrs(node)
                    .iter()
                    .map(|attr| Value::Attr(node, attr.name.local.clone()))
                    .collect(),
            }
        }
        Value::Attr(element, name) => match axis {
            Axis::SelfAxis => vec![Value::Attr(*element, name.clone())],
            Axis::Parent => vec![Value::Node(*element)],
            Axis::Ancestor => axis_values(doc, &Value::Node(*element), Axis::AncestorOrSelf),
            Axis::AncestorOrSelf => {
                let mut ret = vec![Value::Attr(*element, name.clone())];
                ret.extend(axis_values(doc, &Value::Node(*element), Axis::AncestorOrSelf));

                ret
            }
            _ => Vec::new(),
        },
    }
}

fn test_matches(doc: &Document, value: &Value, test: &NodeTest, ctx: &XPathContext) -> bool {
    match value {
        Value::Node(node) => match test {
            NodeTest::AnyNode => true,
            NodeTest::AnyName => doc.kind(*node) == NodeKind::Element,
            NodeTest::Text => doc.kind(*node) == NodeKind::Text,
            NodeTest::Comment => doc.kind(*node) == NodeKind::Comment,
            NodeTest::Name(prefix, local) => {
                if doc.kind(*node) != NodeKind::Element || doc.name(*node) != Some(local) {
                    return false;
                }

                let expected = match prefix {
                    Some(prefix) => {
                        match ctx.namespaces.iter().find(|(p, _)| p == prefix) {
                            Some((_, href)) => Some(href.clone()),
                            // unbound prefix never matches
                            None => return false,
                        }
                    }
                    None => None,
                };

                doc.ns_href(*node) == expected
            }
        },
        Value::Attr(_, name) => match test {
            NodeTest::AnyNode => true,
            NodeTest::Name(None, local) => name == local,
            NodeTest::AnyName => true,
            _ => false,
        },
    }
}

fn preds_match(
    doc: &Document,
    value: &Value,
    preds: &[Pred],
    ctx: &XPathContext,
) -> Result<bool, Error> {
    for pred in preds {
        let inner_ctx = XPathContext {
            node: match value {
                Value::Node(node) => Some(*node),
                Value::Attr(element, _) => Some(*element),
            },
            here: ctx.here.clone(),
            namespaces: ctx.namespaces,
        };

        let values = eval_path(doc, &pred.path, &inner_ctx)?;

        let ok = match &pred.equals {
            None => !values.is_empty(),
            Some(expected) => values
                .iter()
                .any(|v| string_value(doc, v).as_str() == expected),
        };

        if !ok {
            return Ok(false);
        }
    }

    Ok(true)
}

fn string_value(doc: &Document, value: &Value) -> String {
    match value {
        Value::Node(node) => doc.content(*node),
        Value::Attr(element, name) => doc.prop(*element, name).unwrap_or_default().to_owned(),
    }
}

/* Tokenizer */

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Slash,
    DoubleSlash,
    AxisSep,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    Eq,
    Pipe,
    Star,
    Dot,
    DotDot,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, Error> {
    let mut ret = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];

        match c {
            c if c.is_whitespace() => pos += 1,
            '/' => {
                if chars.get(pos + 1) == Some(&'/') {
                    ret.push(Token::DoubleSlash);
                    pos += 2;
                } else {
                    ret.push(Token::Slash);
                    pos += 1;
                }
            }
            ':' => {
                if chars.get(pos + 1) == Some(&':') {
                    ret.push(Token::AxisSep);
                    pos += 2;
                } else {
                    return Err(Error::XPathSyntax(format!(
                        "unexpected ':' at offset {}",
                        pos
                    )));
                }
            }
            '[' => {
                ret.push(Token::LBracket);
                pos += 1;
            }
            ']' => {
                ret.push(Token::RBracket);
                pos += 1;
            }
            '(' => {
                ret.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                ret.push(Token::RParen);
                pos += 1;
            }
            '@' => {
                ret.push(Token::At);
                pos += 1;
            }
            '=' => {
                ret.push(Token::Eq);
                pos += 1;
            }
            '|' => {
                ret.push(Token::Pipe);
                pos += 1;
            }
            '*' => {
                ret.push(Token::Star);
                pos += 1;
            }
            '.' => {
                if chars.get(pos + 1) == Some(&'.') {
                    ret.push(Token::DotDot);
                    pos += 2;
                } else {
                    ret.push(Token::Dot);
                    pos += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut literal = String::new();
                pos += 1;

                loop {
                    match chars.get(pos) {
                        Some(c) if *c == quote => {
                            pos += 1;
                            break;
                        }
                        Some(c) => {
                            literal.push(*c);
                            pos += 1;
                        }
                        None => {
                            return Err(Error::XPathSyntax("unterminated string literal".into()))
                        }
                    }
                }

                ret.push(Token::Literal(literal));
            }
            c if is_name_start(c) => {
                let mut ident = String::new();

                while pos < chars.len() && is_name_char(chars[pos]) {
                    ident.push(chars[pos]);
                    pos += 1;
                }

                // QName: a single ':' joins prefix and local part, '::' is
                // the axis separator
                if chars.get(pos) == Some(&':')
                    && chars.get(pos + 1).copied().map_or(false, is_name_start)
                {
                    ident.push(':');
                    pos += 1;

                    while pos < chars.len() && is_name_char(chars[pos]) {
                        ident.push(chars[pos]);
                        pos += 1;
                    }
                }

                ret.push(Token::Ident(ident));
            }
            c => {
                return Err(Error::XPathSyntax(format!(
                    "unexpected character '{}' in expression",
                    c
                )))
            }
        }
    }

    Ok(ret)
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '.'
}

/* Parser */

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;

            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), Error> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(Error::XPathSyntax(format!(
                "expected {:?}, found {:?}",
                token,
                self.peek()
            )))
        }
    }

    fn path(&mut self) -> Result<Path, Error> {
        let mut steps = Vec::new();

        let start = if self.peek() == Some(&Token::Ident("here".into()))
            && self.peek_at(1) == Some(&Token::LParen)
        {
            self.pos += 1;
            self.expect(Token::LParen)?;
            self.expect(Token::RParen)?;

            if self.eat(&Token::DoubleSlash) {
                steps.push(descendant_or_self_step());
                steps.push(self.step()?);
            } else if self.eat(&Token::Slash) {
                steps.push(self.step()?);
            }

            PathStart::Here
        } else if self.eat(&Token::DoubleSlash) {
            steps.push(descendant_or_self_step());
            steps.push(self.step()?);

            PathStart::Root
        } else if self.eat(&Token::Slash) {
            if self.starts_step() {
                steps.push(self.step()?);
            }

            PathStart::Root
        } else {
            steps.push(self.step()?);

            PathStart::Context
        };

        loop {
            if self.eat(&Token::DoubleSlash) {
                steps.push(descendant_or_self_step());
                steps.push(self.step()?);
            } else if self.eat(&Token::Slash) {
                steps.push(self.step()?);
            } else {
                break;
            }
        }

        Ok(Path { start, steps })
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Ident(_)) | Some(Token::Star) | Some(Token::At) | Some(Token::Dot)
                | Some(Token::DotDot)
        )
    }

    fn step(&mut self) -> Result<Step, Error> {
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::AnyNode,
                preds: self.preds()?,
            });
        }

        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::AnyNode,
                preds: self.preds()?,
            });
        }

        if self.eat(&Token::At) {
            let test = self.node_test()?;

            return Ok(Step {
                axis: Axis::Attribute,
                test,
                preds: self.preds()?,
            });
        }

        let axis = if let (Some(Token::Ident(name)), Some(Token::AxisSep)) =
            (self.peek(), self.peek_at(1))
        {
            let axis = match name.as_str() {
                "self" => Axis::SelfAxis,
                "child" => Axis::Child,
                "parent" => Axis::Parent,
                "ancestor" => Axis::Ancestor,
                "ancestor-or-self" => Axis::AncestorOrSelf,
                "descendant" => Axis::Descendant,
                "descendant-or-self" => Axis::DescendantOrSelf,
                "attribute" => Axis::Attribute,
                x => {
                    return Err(Error::XPathSyntax(format!("unsupported axis '{}'", x)));
                }
            };

            self.pos += 2;

            axis
        } else {
            Axis::Child
        };

        let test = self.node_test()?;

        Ok(Step {
            axis,
            test,
            preds: self.preds()?,
        })
    }

    fn node_test(&mut self) -> Result<NodeTest, Error> {
        if self.eat(&Token::Star) {
            return Ok(NodeTest::AnyName);
        }

        let name = match self.peek() {
            Some(Token::Ident(name)) => name.clone(),
            x => {
                return Err(Error::XPathSyntax(format!(
                    "expected node test, found {:?}",
                    x
                )))
            }
        };
        self.pos += 1;

        if self.eat(&Token::LParen) {
            self.expect(Token::RParen)?;

            return match name.as_str() {
                "text" => Ok(NodeTest::Text),
                "node" => Ok(NodeTest::AnyNode),
                "comment" => Ok(NodeTest::Comment),
                x => Err(Error::XPathSyntax(format!(
                    "unsupported node type test '{}()'",
                    x
                ))),
            };
        }

        match name.find(':') {
            Some(pos) => Ok(NodeTest::Name(
                Some(name[..pos].into()),
                name[pos + 1..].into(),
            )),
            None => Ok(NodeTest::Name(None, name)),
        }
    }

    fn preds(&mut self) -> Result<Vec<Pred>, Error> {
        let mut ret = Vec::new();

        while self.eat(&Token::LBracket) {
            let path = self.path()?;

            let equals = if self.eat(&Token::Eq) {
                match self.peek() {
                    Some(Token::Literal(literal)) => {
                        let literal = literal.clone();
                        self.pos += 1;

                        Some(literal)
                    }
                    x => {
                        return Err(Error::XPathSyntax(format!(
                            "expected string literal, found {:?}",
                            x
                        )))
                    }
                }
            } else {
                None
            };

            self.expect(Token::RBracket)?;

            ret.push(Pred { path, equals });
        }

        Ok(ret)
    }
}

fn descendant_or_self_step() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::AnyNode,
        preds: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(doc: &Document, expr: &str) -> Vec<NodeId> {
        XPath::parse(expr)
            .unwrap()
            .eval(doc, &XPathContext::default())
            .unwrap()
    }

    #[test]
    fn select_descendants() {
        let doc = "<doc><a/><b><x/></b></doc>".parse::<Document>().unwrap();
        let b = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("b"))
            .unwrap();

        let selected = eval(&doc, "//b");
        assert_eq!(selected, vec![b]);
    }

    #[test]
    fn attribute_predicate() {
        let doc = "<doc><e Id=\"one\"/><e Id=\"two\"/></doc>".parse::<Document>().unwrap();

        let selected = eval(&doc, "//e[@Id=\"two\"]");
        assert_eq!(selected.len(), 1);
        assert_eq!(doc.prop(selected[0], "Id"), Some("two"));
    }

    #[test]
    fn self_text_with_parent_predicate() {
        let doc = "<doc><CipherText Id=\"ct\">payload</CipherText><other>x</other></doc>"
            .parse::<Document>()
            .unwrap();

        let expr = XPath::parse("self::text()[parent::CipherText[@Id=\"ct\"]]").unwrap();
        let ctx = XPathContext::default();

        let mut matched = Vec::new();
        for node in doc.descendants(doc.root()) {
            if expr.matches(&doc, node, &ctx).unwrap() {
                matched.push(node);
            }
        }

        assert_eq!(matched.len(), 1);
        assert_eq!(doc.text(matched[0]), Some("payload"));
    }

    #[test]
    fn union() {
        let doc = "<doc><a/><b/><c/></doc>".parse::<Document>().unwrap();

        let selected = eval(&doc, "//a | //c");
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn prefixed_name_test() {
        let doc = "<doc xmlns:p=\"urn:p\"><p:a/><a/></doc>".parse::<Document>().unwrap();

        let bindings = vec![("p".to_owned(), "urn:p".to_owned())];
        let expr = XPath::parse("//p:a").unwrap();
        let ctx = XPathContext {
            namespaces: &bindings,
            ..XPathContext::default()
        };

        let selected = expr.eval(&doc, &ctx).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(doc.ns_href(selected[0]).as_deref(), Some("urn:p"));
    }

    #[test]
    fn here_function() {
        let doc = "<doc><sig uri=\"#x\"/><data Id=\"x\"/></doc>".parse::<Document>().unwrap();
        let sig = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("sig"))
            .unwrap();

        let expr = XPath::parse("here()/ancestor-or-self::doc").unwrap();
        let ctx = XPathContext {
            here: Some(Here {
                element: sig,
                attr: "uri".into(),
            }),
            ..XPathContext::default()
        };

        let selected = expr.eval(&doc, &ctx).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(doc.name(selected[0]), Some("doc"));
    }

    #[test]
    fn rejects_unsupported_syntax() {
        assert!(XPath::parse("count(//a)").is_err());
        assert!(XPath::parse("//a[position()=1]").is_err());
    }
}
