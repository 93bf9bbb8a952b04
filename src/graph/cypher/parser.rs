//! Parser for the read-only Cypher subset.

use crate::error::{KgragError, Result};

const WRITE_KEYWORDS: &[&str] = &[
    "CREATE", "MERGE", "DELETE", "DETACH", "SET", "REMOVE", "DROP", "CALL", "LOAD", "FOREACH",
];
const UNSUPPORTED_CLAUSES: &[&str] = &["OPTIONAL", "WITH", "UNWIND", "UNION"];

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `-[]->`
    Out,
    /// `<-[]-`
    In,
    /// `-[]-`
    Either,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodePattern {
    pub var: Option<String>,
    pub label: Option<String>,
    pub props: Vec<(String, Literal)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelPattern {
    pub var: Option<String>,
    pub types: Vec<String>,
    pub direction: Direction,
}

/// Alternating node and relationship patterns: `nodes.len() == rels.len() + 1`
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub nodes: Vec<NodePattern>,
    pub rels: Vec<RelPattern>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(String),
    Prop(String, String),
    CountStar,
    Count(String),
    Labels(String),
    Type(String),
}

impl Expr {
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::CountStar | Expr::Count(_))
    }

    /// Column name used when no alias is given.
    pub fn display(&self) -> String {
        match self {
            Expr::Var(v) => v.clone(),
            Expr::Prop(v, p) => format!("{}.{}", v, p),
            Expr::CountStar => "count(*)".to_string(),
            Expr::Count(v) => format!("count({})", v),
            Expr::Labels(v) => format!("labels({})", v),
            Expr::Type(v) => format!("type({})", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub var: String,
    pub prop: String,
    pub op: CompareOp,
    pub value: Literal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl ReturnItem {
    pub fn column_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.expr.display())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub pattern: Pattern,
    pub conditions: Vec<Condition>,
    pub distinct: bool,
    pub returns: Vec<ReturnItem>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Dot,
    Pipe,
    Star,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Semicolon,
}

fn invalid(msg: impl Into<String>) -> KgragError {
    KgragError::QueryInvalid(msg.into())
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let symbol = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            ':' => Some(Token::Colon),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            '|' => Some(Token::Pipe),
            '*' => Some(Token::Star),
            '-' => Some(Token::Minus),
            ';' => Some(Token::Semicolon),
            '=' => Some(Token::Eq),
            _ => None,
        };
        if let Some(token) = symbol {
            tokens.push(token);
            i += 1;
            continue;
        }

        match c {
            c if c.is_whitespace() => i += 1,
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Le);
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Ne);
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string literal")),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some(other) => value.push(*other),
                                None => return Err(invalid("unterminated string literal")),
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|ch| *ch == '`')
                    .map(|p| start + p)
                    .ok_or_else(|| invalid("unterminated quoted identifier"))?;
                tokens.push(Token::Ident(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // `1..3` style ranges are not part of the subset; stop before a second dot
                    if chars[i] == '.' && !chars.get(i + 1).map(|n| n.is_ascii_digit()).unwrap_or(false) {
                        break;
                    }
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(invalid(format!("expected {} but found {:?}", what, t))),
            None => Err(invalid(format!("expected {} but query ended", what))),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(invalid(format!("expected {}", keyword)))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            Some(t) => Err(invalid(format!("expected {} but found {:?}", what, t))),
            None => Err(invalid(format!("expected {} but query ended", what))),
        }
    }

    fn literal(&mut self) -> Result<Literal> {
        let negative = if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            true
        } else {
            false
        };
        match self.next() {
            Some(Token::Str(s)) if !negative => Ok(Literal::Str(s)),
            Some(Token::Number(n)) => {
                let text = if negative { format!("-{}", n) } else { n };
                if text.contains('.') {
                    text.parse::<f64>()
                        .map(Literal::Float)
                        .map_err(|_| invalid(format!("bad number {}", text)))
                } else {
                    text.parse::<i64>()
                        .map(Literal::Int)
                        .map_err(|_| invalid(format!("bad number {}", text)))
                }
            }
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("true") => Ok(Literal::Bool(true)),
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("false") => Ok(Literal::Bool(false)),
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("null") => Ok(Literal::Null),
            Some(t) => Err(invalid(format!("expected a literal but found {:?}", t))),
            None => Err(invalid("expected a literal but query ended")),
        }
    }

    fn node_pattern(&mut self) -> Result<NodePattern> {
        self.expect(Token::LParen, "'('")?;
        let mut node = NodePattern {
            var: None,
            label: None,
            props: Vec::new(),
        };
        if let Some(Token::Ident(_)) = self.peek() {
            node.var = Some(self.ident("variable")?);
        }
        if self.peek() == Some(&Token::Colon) {
            self.pos += 1;
            node.label = Some(self.ident("label")?);
            if self.peek() == Some(&Token::Colon) {
                return Err(invalid("multiple labels per node are not supported"));
            }
        }
        if self.peek() == Some(&Token::LBrace) {
            node.props = self.property_map()?;
        }
        self.expect(Token::RParen, "')'")?;
        Ok(node)
    }

    fn property_map(&mut self) -> Result<Vec<(String, Literal)>> {
        self.expect(Token::LBrace, "'{'")?;
        let mut props = Vec::new();
        if self.peek() == Some(&Token::RBrace) {
            self.pos += 1;
            return Ok(props);
        }
        loop {
            let key = self.ident("property name")?;
            self.expect(Token::Colon, "':'")?;
            let value = self.literal()?;
            props.push((key, value));
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBrace) => break,
                _ => return Err(invalid("expected ',' or '}' in property map")),
            }
        }
        Ok(props)
    }

    fn rel_pattern(&mut self) -> Result<RelPattern> {
        let incoming = if self.peek() == Some(&Token::Lt) {
            self.pos += 1;
            true
        } else {
            false
        };
        self.expect(Token::Minus, "'-'")?;

        let mut rel = RelPattern {
            var: None,
            types: Vec::new(),
            direction: Direction::Either,
        };

        if self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            if let Some(Token::Ident(_)) = self.peek() {
                rel.var = Some(self.ident("variable")?);
            }
            if self.peek() == Some(&Token::Colon) {
                self.pos += 1;
                rel.types.push(self.ident("relationship type")?);
                while self.peek() == Some(&Token::Pipe) {
                    self.pos += 1;
                    if self.peek() == Some(&Token::Colon) {
                        self.pos += 1;
                    }
                    rel.types.push(self.ident("relationship type")?);
                }
            }
            if self.peek() == Some(&Token::Star) {
                return Err(invalid("variable-length relationships are not supported"));
            }
            if self.peek() == Some(&Token::LBrace) {
                return Err(invalid("relationship properties are not supported"));
            }
            self.expect(Token::RBracket, "']'")?;
        }

        self.expect(Token::Minus, "'-'")?;
        let outgoing = if self.peek() == Some(&Token::Gt) {
            self.pos += 1;
            true
        } else {
            false
        };

        rel.direction = match (incoming, outgoing) {
            (true, true) => return Err(invalid("relationship cannot point both ways")),
            (true, false) => Direction::In,
            (false, true) => Direction::Out,
            (false, false) => Direction::Either,
        };
        Ok(rel)
    }

    fn pattern(&mut self) -> Result<Pattern> {
        let mut pattern = Pattern {
            nodes: vec![self.node_pattern()?],
            rels: Vec::new(),
        };
        while matches!(self.peek(), Some(Token::Minus) | Some(Token::Lt)) {
            pattern.rels.push(self.rel_pattern()?);
            pattern.nodes.push(self.node_pattern()?);
        }
        if self.peek() == Some(&Token::Comma) {
            return Err(invalid("only a single path pattern is supported"));
        }
        Ok(pattern)
    }

    fn condition(&mut self) -> Result<Condition> {
        let var = self.ident("variable")?;
        self.expect(Token::Dot, "'.'")?;
        let prop = self.ident("property name")?;
        let op = match self.next() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("CONTAINS") => CompareOp::Contains,
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("STARTS") => {
                self.expect_keyword("WITH")?;
                CompareOp::StartsWith
            }
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("ENDS") => {
                self.expect_keyword("WITH")?;
                CompareOp::EndsWith
            }
            Some(t) => return Err(invalid(format!("unsupported operator {:?}", t))),
            None => return Err(invalid("expected an operator but query ended")),
        };
        let value = self.literal()?;
        Ok(Condition { var, prop, op, value })
    }

    fn expr(&mut self) -> Result<Expr> {
        let name = self.ident("expression")?;
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let expr = match name.to_ascii_lowercase().as_str() {
                "count" if self.peek() == Some(&Token::Star) => {
                    self.pos += 1;
                    Expr::CountStar
                }
                "count" => Expr::Count(self.ident("variable")?),
                "labels" => Expr::Labels(self.ident("variable")?),
                "type" => Expr::Type(self.ident("variable")?),
                other => return Err(invalid(format!("unsupported function {}()", other))),
            };
            self.expect(Token::RParen, "')'")?;
            return Ok(expr);
        }
        if self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            let prop = self.ident("property name")?;
            return Ok(Expr::Prop(name, prop));
        }
        Ok(Expr::Var(name))
    }

    fn query(&mut self) -> Result<Query> {
        self.expect_keyword("MATCH")?;
        let pattern = self.pattern()?;

        let mut conditions = Vec::new();
        if self.eat_keyword("WHERE") {
            conditions.push(self.condition()?);
            while self.eat_keyword("AND") {
                conditions.push(self.condition()?);
            }
            if self.is_keyword("OR") || self.is_keyword("NOT") || self.is_keyword("XOR") {
                return Err(invalid("only AND-joined conditions are supported"));
            }
        }

        if self.is_keyword("MATCH") {
            return Err(invalid("only a single MATCH clause is supported"));
        }
        self.expect_keyword("RETURN")?;
        let distinct = self.eat_keyword("DISTINCT");

        let mut returns = Vec::new();
        loop {
            let expr = self.expr()?;
            let alias = if self.eat_keyword("AS") {
                Some(self.ident("alias")?)
            } else {
                None
            };
            returns.push(ReturnItem { expr, alias });
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
            } else {
                break;
            }
        }

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let expr = self.expr()?;
                let descending = if self.eat_keyword("DESC") || self.eat_keyword("DESCENDING") {
                    true
                } else {
                    self.eat_keyword("ASC") || self.eat_keyword("ASCENDING");
                    false
                };
                order_by.push(OrderItem { expr, descending });
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let mut limit = None;
        if self.eat_keyword("LIMIT") {
            match self.next() {
                Some(Token::Number(n)) => {
                    let n: usize = n.parse().map_err(|_| invalid(format!("bad LIMIT {}", n)))?;
                    limit = Some(n);
                }
                _ => return Err(invalid("LIMIT expects a non-negative integer")),
            }
        }

        if self.peek() == Some(&Token::Semicolon) {
            self.pos += 1;
        }
        if !self.at_end() {
            return match self.peek() {
                Some(Token::Ident(s)) if UNSUPPORTED_CLAUSES.iter().any(|c| s.eq_ignore_ascii_case(c)) => {
                    Err(invalid(format!("{} clause is not supported", s.to_ascii_uppercase())))
                }
                Some(t) => Err(invalid(format!("unexpected trailing input {:?}", t))),
                None => Err(invalid("unexpected trailing input")),
            };
        }

        Ok(Query {
            pattern,
            conditions,
            distinct,
            returns,
            order_by,
            limit,
        })
    }
}

/// Parse and validate a read-only query.
pub fn parse(input: &str) -> Result<Query> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(invalid("empty query"));
    }

    // Identifier tokens only, so a string literal like 'set' is fine.
    for token in &tokens {
        if let Token::Ident(word) = token {
            if let Some(keyword) = WRITE_KEYWORDS.iter().find(|k| word.eq_ignore_ascii_case(k)) {
                return Err(invalid(format!("write operation {} is not allowed; queries are read-only", keyword)));
            }
        }
    }
    if matches!(tokens.first(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case("OPTIONAL")) {
        return Err(invalid("OPTIONAL MATCH is not supported"));
    }

    let mut parser = Parser { tokens, pos: 0 };
    parser.query()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_with_where_and_order() {
        let q = parse(
            "MATCH (o:Order)-[r:HAS_CUSTOMER]->(c:Customer {city: 'London'}) \
             WHERE o.quantity >= 1 AND c.name STARTS WITH 'Ada' \
             RETURN c.name AS name, count(o) ORDER BY name DESC LIMIT 5",
        )
        .unwrap();

        assert_eq!(q.pattern.nodes.len(), 2);
        assert_eq!(q.pattern.rels[0].direction, Direction::Out);
        assert_eq!(q.pattern.rels[0].types, vec!["HAS_CUSTOMER"]);
        assert_eq!(q.pattern.nodes[1].props, vec![("city".to_string(), Literal::Str("London".to_string()))]);
        assert_eq!(q.conditions.len(), 2);
        assert_eq!(q.conditions[1].op, CompareOp::StartsWith);
        assert_eq!(q.returns[0].column_name(), "name");
        assert_eq!(q.returns[1].expr, Expr::Count("o".to_string()));
        assert!(q.order_by[0].descending);
        assert_eq!(q.limit, Some(5));
    }

    #[test]
    fn test_incoming_and_undirected() {
        let q = parse("MATCH (c:Customer)<-[:HAS_CUSTOMER]-(o)--(p) RETURN p").unwrap();
        assert_eq!(q.pattern.rels[0].direction, Direction::In);
        assert_eq!(q.pattern.rels[1].direction, Direction::Either);
        assert!(q.pattern.rels[1].types.is_empty());
    }

    #[test]
    fn test_type_alternatives_and_functions() {
        let q = parse("MATCH (a)-[r:HAS_A|HAS_B]-(b) RETURN DISTINCT type(r), labels(b), count(*)").unwrap();
        assert_eq!(q.pattern.rels[0].types, vec!["HAS_A", "HAS_B"]);
        assert!(q.distinct);
        assert_eq!(q.returns[2].expr, Expr::CountStar);
    }

    #[test]
    fn test_negative_and_float_literals() {
        let q = parse("MATCH (p:Product) WHERE p.price < -1.5 RETURN p").unwrap();
        assert_eq!(q.conditions[0].value, Literal::Float(-1.5));
    }

    #[test]
    fn test_write_keywords_rejected() {
        for query in [
            "CREATE (n:Customer {id: 1})",
            "MATCH (n) DETACH DELETE n",
            "MATCH (n) SET n.name = 'x' RETURN n",
            "MERGE (n:Customer) RETURN n",
            "CALL db.labels()",
        ] {
            let err = parse(query).unwrap_err();
            assert_eq!(err.kind(), "query_invalid", "{}", query);
        }
    }

    #[test]
    fn test_string_literal_may_contain_keywords() {
        let q = parse("MATCH (p:Product) WHERE p.name CONTAINS 'set' RETURN p.name").unwrap();
        assert_eq!(q.conditions[0].value, Literal::Str("set".to_string()));
    }

    #[test]
    fn test_malformed_queries_rejected() {
        for query in [
            "",
            "MATCH (n RETURN n",
            "MATCH (n) RETURN",
            "MATCH (n) WHERE n.x = 1 OR n.y = 2 RETURN n",
            "MATCH (a), (b) RETURN a",
            "MATCH (a)-[*1..3]->(b) RETURN a",
            "MATCH (n) RETURN n LIMIT 'x'",
            "MATCH (n) RETURN n WITH n",
            "OPTIONAL MATCH (n) RETURN n",
            "RETURN 1",
        ] {
            assert!(parse(query).is_err(), "{}", query);
        }
    }
}
