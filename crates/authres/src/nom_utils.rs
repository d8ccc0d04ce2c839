use nom::error::{ContextError, ErrorKind};
use nom_locate::LocatedSpan;
use std::fmt::{Debug, Write};

pub(crate) type Span<'a> = LocatedSpan<&'a str>;
pub(crate) type IResult<'a, A, B> = nom::IResult<A, B, ParseError<Span<'a>>>;

pub(crate) fn make_span(s: &str) -> Span {
    Span::new(s)
}

#[derive(Debug)]
pub(crate) enum ParseErrorKind {
    Context(&'static str),
    Char(char),
    Nom(ErrorKind),
}

#[derive(Debug)]
pub(crate) struct ParseError<I: Debug> {
    pub errors: Vec<(I, ParseErrorKind)>,
}

impl<I: Debug> ContextError<I> for ParseError<I> {
    fn add_context(input: I, ctx: &'static str, mut other: Self) -> Self {
        other.errors.push((input, ParseErrorKind::Context(ctx)));
        other
    }
}

impl<I: Debug> nom::error::ParseError<I> for ParseError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        Self {
            errors: vec![(input, ParseErrorKind::Nom(kind))],
        }
    }

    fn append(input: I, kind: ErrorKind, mut other: Self) -> Self {
        other.errors.push((input, ParseErrorKind::Nom(kind)));
        other
    }

    fn from_char(input: I, c: char) -> Self {
        Self {
            errors: vec![(input, ParseErrorKind::Char(c))],
        }
    }
}

pub(crate) fn explain_nom(input: Span, err: nom::Err<ParseError<Span<'_>>>) -> String {
    match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let mut result = String::new();
            for (i, (span, kind)) in e.errors.iter().enumerate() {
                if input.is_empty() {
                    match kind {
                        ParseErrorKind::Char(c) => {
                            write!(&mut result, "{i}: expected '{c}', got empty input\n")
                        }
                        ParseErrorKind::Context(s) => {
                            write!(&mut result, "{i}: in {s}, got empty input\n")
                        }
                        ParseErrorKind::Nom(e) => {
                            write!(&mut result, "{i}: in {e:?}, got empty input\n")
                        }
                    }
                    .ok();
                    continue;
                }

                let column = span.get_utf8_column();
                match kind {
                    ParseErrorKind::Char(expected) => {
                        if let Some(actual) = span.fragment().chars().next() {
                            write!(
                                &mut result,
                                "{i}: at column {column}: expected '{expected}', found {actual}\n",
                            )
                        } else {
                            write!(
                                &mut result,
                                "{i}: at column {column}: expected '{expected}', got end of input\n",
                            )
                        }
                    }
                    ParseErrorKind::Context(context) => {
                        write!(&mut result, "{i}: at column {column}, in {context}\n",)
                    }
                    ParseErrorKind::Nom(nom_err) => {
                        write!(&mut result, "{i}: at column {column}, in {nom_err:?}\n",)
                    }
                }
                .ok();
            }
            result
        }
        _ => format!("{err:#}"),
    }
}
