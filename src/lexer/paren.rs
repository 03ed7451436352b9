//! Parenthesized tree reader for BTF type expressions
//!
//! Terminals are separated by whitespace; child lists are enclosed in
//! balanced parentheses, e.g. `struct ((int unsigned 3) x) ((* foo) p)`.

use crate::error::{Error, Result};

/// One node of a parsed type expression
#[derive(Debug, Clone, PartialEq)]
pub enum Sexp {
    /// A terminal word
    Atom(String),
    /// A parenthesized child list
    List(Vec<Sexp>),
}

impl Sexp {
    /// The word, if this node is a terminal
    pub fn atom(&self) -> Option<&str> {
        match self {
            Sexp::Atom(s) => Some(s),
            Sexp::List(_) => None,
        }
    }
}

/// Parse a type expression into its top-level node sequence
pub fn parse_string(text: &str) -> Result<Vec<Sexp>> {
    let mut tokens = tokenize(text);
    let nodes = parse_nodes(&mut tokens, text)?;
    if !tokens.is_empty() {
        return Err(Error::UnbalancedParens(text.to_string()));
    }
    Ok(nodes)
}

enum Tok {
    Open,
    Close,
    Word(String),
}

fn tokenize(text: &str) -> std::collections::VecDeque<Tok> {
    let mut toks = std::collections::VecDeque::new();
    let mut word = String::new();
    for c in text.chars() {
        if c == '(' || c == ')' || c.is_whitespace() {
            if !word.is_empty() {
                toks.push_back(Tok::Word(std::mem::take(&mut word)));
            }
            match c {
                '(' => toks.push_back(Tok::Open),
                ')' => toks.push_back(Tok::Close),
                _ => {}
            }
        } else {
            word.push(c);
        }
    }
    if !word.is_empty() {
        toks.push_back(Tok::Word(word));
    }
    toks
}

fn parse_nodes(tokens: &mut std::collections::VecDeque<Tok>, src: &str) -> Result<Vec<Sexp>> {
    let mut nodes = Vec::new();
    while let Some(tok) = tokens.pop_front() {
        match tok {
            Tok::Word(w) => nodes.push(Sexp::Atom(w)),
            Tok::Open => {
                let children = parse_list(tokens, src)?;
                nodes.push(Sexp::List(children));
            }
            Tok::Close => return Err(Error::UnbalancedParens(src.to_string())),
        }
    }
    Ok(nodes)
}

fn parse_list(tokens: &mut std::collections::VecDeque<Tok>, src: &str) -> Result<Vec<Sexp>> {
    let mut nodes = Vec::new();
    loop {
        match tokens.pop_front() {
            Some(Tok::Word(w)) => nodes.push(Sexp::Atom(w)),
            Some(Tok::Open) => nodes.push(Sexp::List(parse_list(tokens, src)?)),
            Some(Tok::Close) => return Ok(nodes),
            None => return Err(Error::UnbalancedParens(src.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(s: &str) -> Sexp {
        Sexp::Atom(s.to_string())
    }

    #[test]
    fn nested_lists() {
        let got = parse_string("a (b\t (c))").unwrap();
        assert_eq!(
            got,
            vec![
                atom("a"),
                Sexp::List(vec![atom("b"), Sexp::List(vec![atom("c")])]),
            ]
        );
    }

    #[test]
    fn sibling_lists() {
        let got = parse_string("a (b c (d)) e (f)").unwrap();
        assert_eq!(
            got,
            vec![
                atom("a"),
                Sexp::List(vec![atom("b"), atom("c"), Sexp::List(vec![atom("d")])]),
                atom("e"),
                Sexp::List(vec![atom("f")]),
            ]
        );
    }

    #[test]
    fn unbalanced() {
        assert!(parse_string("a (b").is_err());
        assert!(parse_string("a )b(").is_err());
    }
}
