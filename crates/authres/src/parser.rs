use crate::nom_utils::{explain_nom, make_span, IResult, Span};
use crate::AuthResError;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, satisfy};
use nom::combinator::{all_consuming, map, opt, recognize, verify};
use nom::error::context;
use nom::multi::{many0, many1};
use nom::sequence::{delimited, preceded, tuple};
use serde::{Deserialize, Serialize};

/// A parsed Authentication-Results header:
/// `authserv-id [version] ( ';' resinfo )* | 'none'`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResults {
    pub serv_id: String,
    pub version: Option<u32>,
    pub results: Vec<AuthenticationResult>,
}

/// One method statement within an Authentication-Results header.
/// Properties are kept in their original order; the printer reproduces
/// them as parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResult {
    pub method: String,
    pub method_version: Option<u32>,
    pub result: String,
    pub reason: Option<String>,
    /// A comment that trailed the reason value; reproduced by the
    /// printer. All other comments are dropped.
    pub reason_comment: Option<String>,
    pub props: Vec<(String, String)>,
}

impl AuthenticationResult {
    pub fn new(method: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            method_version: None,
            result: result.into(),
            reason: None,
            reason_comment: None,
            props: vec![],
        }
    }

    pub fn prop(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.push((name.into(), value.into()));
        self
    }
}

/// The property types recognised by RFC8601 plus the `dns` ptype of
/// RFC8904. A statement carrying any other ptype invalidates the whole
/// header.
const KNOWN_PTYPES: &[&str] = &["smtp", "header", "body", "policy", "dns"];

// ctl = { '\u{00}'..'\u{1f}' | "\u{7f}" }
fn is_ctl(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{1f}' | '\u{7f}')
}

// char = { '\u{01}'..'\u{ff}' }
fn is_char(c: char) -> bool {
    matches!(c, '\u{01}'..='\u{ff}')
}

fn is_utf8_non_ascii(c: char) -> bool {
    let c = c as u32;
    c == 0 || c >= 0x80
}

fn is_tspecial(c: char) -> bool {
    matches!(
        c,
        '(' | ')' | '<' | '>' | '@' | ',' | ';' | ':' | '\\' | '"' | '/' | '[' | ']' | '?' | '='
    )
}

fn is_token(c: char) -> bool {
    is_char(c) && c != ' ' && !is_ctl(c) && !is_tspecial(c)
}

fn is_obs_no_ws_ctl(c: char) -> bool {
    matches!(c, '\u{01}'..='\u{08}' | '\u{0b}'..='\u{0c}' | '\u{0e}'..='\u{1f}' | '\u{7f}')
}

// ctext = { '\u{21}'..'\u{27}' | '\u{2a}'..'\u{5b}' | '\u{5d}'..'\u{7e}' | obs_ctext | utf8_non_ascii }
fn is_ctext(c: char) -> bool {
    match c {
        '\u{21}'..='\u{27}' | '\u{2a}'..='\u{5b}' | '\u{5d}'..='\u{7e}' => true,
        c => is_obs_no_ws_ctl(c) || is_utf8_non_ascii(c),
    }
}

// qtext = { "\u{21}" | '\u{23}'..'\u{5b}' | '\u{5d}'..'\u{7e}' | obs_qtext | utf8_non_ascii }
fn is_qtext(c: char) -> bool {
    match c {
        '\u{21}' | '\u{23}'..='\u{5b}' | '\u{5d}'..='\u{7e}' => true,
        c => is_obs_no_ws_ctl(c) || is_utf8_non_ascii(c),
    }
}

fn is_quoted_pair(c: char) -> bool {
    let u = c as u32;
    (0x21..=0x7e).contains(&u) || c == ' ' || c == '\t' || is_utf8_non_ascii(c)
}

fn wsp(input: Span) -> IResult<Span, Span> {
    context("wsp", take_while1(|c| c == ' ' || c == '\t'))(input)
}

fn newline(input: Span) -> IResult<Span, Span> {
    context("newline", recognize(preceded(opt(char('\r')), char('\n'))))(input)
}

// fws = { ((wsp* ~ "\r"? ~ "\n")* ~ wsp+) | obs_fws }
fn fws(input: Span) -> IResult<Span, Span> {
    context(
        "fws",
        alt((
            recognize(preceded(many0(preceded(many0(wsp), newline)), many1(wsp))),
            obs_fws,
        )),
    )(input)
}

// obs_fws = { wsp+ ~ ("\r"? ~ "\n" ~ wsp+)* }
fn obs_fws(input: Span) -> IResult<Span, Span> {
    context(
        "obs_fws",
        recognize(preceded(many1(wsp), preceded(newline, many1(wsp)))),
    )(input)
}

fn quoted_pair(input: Span) -> IResult<Span, char> {
    context("quoted_pair", preceded(char('\\'), satisfy(is_quoted_pair)))(input)
}

// comment = { "(" ~ (fws? ~ ccontent)* ~ fws? ~ ")" }, comments nest
fn comment(input: Span) -> IResult<Span, Span> {
    context(
        "comment",
        recognize(tuple((
            char('('),
            many0(tuple((opt(fws), ccontent))),
            opt(fws),
            char(')'),
        ))),
    )(input)
}

// ccontent = { ctext | quoted_pair | comment }
fn ccontent(input: Span) -> IResult<Span, Span> {
    context(
        "ccontent",
        alt((
            recognize(satisfy(is_ctext)),
            recognize(quoted_pair),
            comment,
        )),
    )(input)
}

fn cfws(input: Span) -> IResult<Span, Span> {
    context(
        "cfws",
        recognize(alt((
            recognize(tuple((many1(tuple((opt(fws), comment))), opt(fws)))),
            fws,
        ))),
    )(input)
}

/// A comment, returning its inner text
fn comment_text(input: Span) -> IResult<Span, String> {
    let (loc, raw) = comment(input)?;
    let text = raw.fragment();
    let inner = &text[1..text.len() - 1];
    Ok((loc, inner.trim().to_string()))
}

/// pvalue may be a token, a mailbox-ish value, or a quoted string
fn pvalue_token(input: Span) -> IResult<Span, String> {
    context(
        "pvalue_token",
        map(take_while1(|c| is_token(c) || c == '@'), |s: Span| {
            s.to_string()
        }),
    )(input)
}

// quoted_string without surrounding CFWS; FWS within collapses to SP
fn quoted_string(input: Span) -> IResult<Span, String> {
    let (loc, (bits, trailer)) = context(
        "quoted_string",
        delimited(
            char('"'),
            tuple((
                many0(tuple((
                    opt(fws),
                    alt((satisfy(is_qtext), quoted_pair)),
                ))),
                opt(fws),
            )),
            char('"'),
        ),
    )(input)?;

    let mut result = String::new();
    for (ws, c) in bits {
        if ws.is_some() {
            result.push(' ');
        }
        result.push(c);
    }
    if trailer.is_some() {
        result.push(' ');
    }

    Ok((loc, result))
}

fn value(input: Span) -> IResult<Span, String> {
    context("value", alt((quoted_string, pvalue_token)))(input)
}

// Taken from RFC8601 which says that this is the same as the SMTP
// Keyword token
fn keyword(input: Span) -> IResult<Span, String> {
    context(
        "keyword",
        map(
            take_while1(|c: char| {
                c.is_ascii_alphanumeric() || c == '-' || c == '+' || c == '_'
            }),
            |s: Span| s.to_string(),
        ),
    )(input)
}

fn digits(input: Span) -> IResult<Span, Span> {
    take_while1(|c: char| c.is_ascii_digit())(input)
}

/// The header version. If present it must be the token `1`; any other
/// token invalidates the whole header.
fn version(input: Span) -> IResult<Span, u32> {
    context(
        "version",
        map(
            preceded(
                alt((
                    recognize(tuple((opt(cfws), char('/'), opt(cfws)))),
                    cfws,
                )),
                verify(digits, |s: &Span| *s.fragment() == "1"),
            ),
            |_| 1,
        ),
    )(input)
}

fn no_result(input: Span) -> IResult<Span, Vec<AuthenticationResult>> {
    context(
        "no_result",
        map(
            tuple((
                opt(cfws),
                char(';'),
                opt(cfws),
                verify(keyword, |k: &String| k == "none"),
            )),
            |_| vec![],
        ),
    )(input)
}

fn methodspec(input: Span) -> IResult<Span, (String, Option<u32>, String)> {
    context(
        "methodspec",
        map(
            tuple((
                opt(cfws),
                tuple((keyword, opt(methodversion))),
                opt(cfws),
                char('='),
                opt(cfws),
                keyword,
            )),
            |(_, (method, methodversion), _, _, _, result)| (method, methodversion, result),
        ),
    )(input)
}

fn methodversion(input: Span) -> IResult<Span, u32> {
    context(
        "methodversion",
        preceded(
            tuple((opt(cfws), char('/'), opt(cfws))),
            nom::character::complete::u32,
        ),
    )(input)
}

/// `reason=` must immediately follow the result. A trailing comment is
/// retained for the printer.
fn reasonspec(input: Span) -> IResult<Span, (String, Option<String>)> {
    context(
        "reason",
        map(
            tuple((
                tag("reason"),
                opt(cfws),
                char('='),
                opt(cfws),
                value,
                opt(preceded(opt(fws), comment_text)),
            )),
            |(_, _, _, _, value, comment)| (value, comment),
        ),
    )(input)
}

fn propspec(input: Span) -> IResult<Span, (String, String)> {
    context(
        "propspec",
        map(
            tuple((
                opt(cfws),
                verify(keyword, |ptype: &String| {
                    KNOWN_PTYPES
                        .iter()
                        .any(|known| ptype.eq_ignore_ascii_case(known))
                }),
                opt(cfws),
                char('.'),
                opt(cfws),
                keyword,
                opt(cfws),
                char('='),
                opt(cfws),
                value,
                opt(cfws),
            )),
            |(_, ptype, _, _, _, property, _, _, _, value, _)| {
                (format!("{ptype}.{property}"), value)
            },
        ),
    )(input)
}

fn resinfo(input: Span) -> IResult<Span, AuthenticationResult> {
    context(
        "resinfo",
        map(
            tuple((
                opt(cfws),
                char(';'),
                methodspec,
                opt(preceded(cfws, reasonspec)),
                opt(many1(propspec)),
            )),
            |(_, _, (method, method_version, result), reason, props)| {
                let (reason, reason_comment) = match reason {
                    Some((value, comment)) => (Some(value), comment),
                    None => (None, None),
                };
                AuthenticationResult {
                    method,
                    method_version,
                    result,
                    reason,
                    reason_comment,
                    props: props.unwrap_or_default(),
                }
            },
        ),
    )(input)
}

fn authentication_results(input: Span) -> IResult<Span, AuthenticationResults> {
    context(
        "authentication_results",
        map(
            tuple((
                opt(cfws),
                value,
                opt(version),
                alt((no_result, many1(resinfo))),
                opt(cfws),
            )),
            |(_, serv_id, version, results, _)| AuthenticationResults {
                serv_id,
                version,
                results,
            },
        ),
    )(input)
}

impl AuthenticationResults {
    /// Parse an Authentication-Results header value. The parser consumes
    /// the entire input: a header that ends mid-token is rejected whole.
    pub fn parse(text: &str) -> Result<Self, AuthResError> {
        let span = make_span(text);
        match all_consuming(authentication_results)(span) {
            Ok((_, results)) => Ok(results),
            Err(err) => Err(AuthResError::HeaderParse(explain_nom(span, err))),
        }
    }

    pub fn new(serv_id: impl Into<String>) -> Self {
        Self {
            serv_id: serv_id.into(),
            version: None,
            results: vec![],
        }
    }

    pub fn push(&mut self, result: AuthenticationResult) {
        self.results.push(result);
    }

    /// Render the header value. The first statement shares the
    /// authserv-id line; each further statement starts a folded line.
    pub fn encode_value(&self) -> String {
        let mut out = match self.version {
            Some(v) => format!("{} {v}", self.serv_id),
            None => self.serv_id.clone(),
        };

        if self.results.is_empty() {
            out.push_str("; none");
            return out;
        }

        for (idx, res) in self.results.iter().enumerate() {
            if idx == 0 {
                out.push_str("; ");
            } else {
                out.push_str(";\r\n\t");
            }
            emit_value_token(&res.method, &mut out);
            if let Some(v) = res.method_version {
                out.push('/');
                out.push_str(&v.to_string());
            }
            out.push('=');
            emit_value_token(&res.result, &mut out);
            if let Some(reason) = &res.reason {
                out.push_str(" reason=");
                emit_value_token(reason, &mut out);
                if let Some(comment) = &res.reason_comment {
                    out.push_str(&format!(" ({comment})"));
                }
            }
            for (name, value) in &res.props {
                out.push(' ');
                out.push_str(name);
                out.push('=');
                emit_value_token(value, &mut out);
            }
        }

        out
    }
}

/// Emits a value that was parsed by `value`, re-quoting when needed
fn emit_value_token(value: &str, target: &mut String) {
    let use_quoted_string =
        value.is_empty() || !value.chars().all(|c| is_token(c) || c == '@');
    if use_quoted_string {
        target.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                target.push('\\');
            }
            target.push(c);
        }
        target.push('"');
    } else {
        target.push_str(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> AuthenticationResults {
        AuthenticationResults::parse(text).unwrap()
    }

    #[test]
    fn basic() {
        let ar = parse("example.com; spf=pass smtp.mailfrom=sender@example.net");
        assert_eq!(ar.serv_id, "example.com");
        assert_eq!(ar.version, None);
        assert_eq!(ar.results.len(), 1);
        assert_eq!(ar.results[0].method, "spf");
        assert_eq!(ar.results[0].result, "pass");
        assert_eq!(
            ar.results[0].props,
            vec![("smtp.mailfrom".to_string(), "sender@example.net".to_string())]
        );
    }

    #[test]
    fn no_results() {
        let ar = parse("example.com; none");
        assert!(ar.results.is_empty());
        let ar = parse("example.com 1; none");
        assert_eq!(ar.version, Some(1));

        // trailing comment after none
        let ar = parse("example.com; none (no authentication done)");
        assert!(ar.results.is_empty());
    }

    #[test]
    fn version_token() {
        assert_eq!(parse("example.com/1; spf=pass").version, Some(1));
        assert_eq!(parse("example.com 1; spf=pass").version, Some(1));

        // anything other than the token 1 invalidates the whole header
        assert!(AuthenticationResults::parse("example.com 12.0; spf=pass").is_err());
        assert!(AuthenticationResults::parse("example.com a; spf=pass").is_err());
        assert!(AuthenticationResults::parse("example.com 1 1; spf=pass").is_err());
    }

    #[test]
    fn comments_are_cfws() {
        let ar = parse(
            "example.com;\r\n\tdkim=pass (1024-bit key) header.d=example.com (whose key?)",
        );
        assert_eq!(ar.results[0].method, "dkim");
        assert_eq!(
            ar.results[0].props,
            vec![("header.d".to_string(), "example.com".to_string())]
        );

        // comments nest
        let ar = parse("example.com; dkim=pass (outer (inner) comment) header.d=example.com");
        assert_eq!(ar.results[0].result, "pass");
    }

    #[test]
    fn reason_placement() {
        let ar = parse("example.com; spf=fail reason=\"bad sender\" smtp.mailfrom=x@example.net");
        assert_eq!(ar.results[0].reason.as_deref(), Some("bad sender"));
        assert_eq!(ar.results[0].props.len(), 1);

        // reason after a property invalidates the header
        assert!(AuthenticationResults::parse(
            "example.com; spf=fail smtp.mailfrom=x@example.net reason=\"bad sender\""
        )
        .is_err());
    }

    #[test]
    fn reason_trailing_comment() {
        let ar = parse("example.com; spf=fail reason=\"bad sender\" (moved mailbox)");
        assert_eq!(ar.results[0].reason.as_deref(), Some("bad sender"));
        assert_eq!(ar.results[0].reason_comment.as_deref(), Some("moved mailbox"));
        assert_eq!(
            ar.encode_value(),
            "example.com; spf=fail reason=\"bad sender\" (moved mailbox)"
        );
    }

    #[test]
    fn unknown_method_is_retained() {
        // RFC8904 dnswl with the dns ptype
        let ar = parse(
            "example.com;\r\n\
             \tdnswl=pass dns.zone=list.dnswl.org policy.ip=127.0.10.1\r\n\
             \tpolicy.txt=\"fwd=127.0.0.2\"",
        );
        assert_eq!(ar.results[0].method, "dnswl");
        assert_eq!(ar.results[0].props.len(), 3);
    }

    #[test]
    fn unknown_ptype_invalidates_header() {
        assert!(
            AuthenticationResults::parse("example.com; foo=pass bar.baz=blah").is_err()
        );
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(AuthenticationResults::parse("example.com; spf=").is_err());
        assert!(
            AuthenticationResults::parse("example.com; iprev=pass policy.iprev=\"1").is_err()
        );
        assert!(AuthenticationResults::parse("example.com; iprev=pass policy.iprev=\"1\" (")
            .is_err());
        assert!(AuthenticationResults::parse("example.com; spf=pass;").is_err());
    }

    #[test]
    fn quoted_string_escapes() {
        let ar = parse(r#"example.com; dkim=pass header.b="quoted \"b\" value""#);
        assert_eq!(
            ar.results[0].props[0].1,
            "quoted \"b\" value".to_string()
        );

        // non-ASCII survives a quoted string
        let ar = parse("example.com; dkim=pass header.from=\"андрей@example.com\"");
        assert_eq!(ar.results[0].props[0].1, "андрей@example.com");
    }

    #[test]
    fn method_version() {
        let ar = parse("example.com; dkim/1=pass header.d=example.com");
        assert_eq!(ar.results[0].method_version, Some(1));
        assert_eq!(
            ar.encode_value(),
            "example.com; dkim/1=pass header.d=example.com"
        );
    }

    #[test]
    fn multiple_statements() {
        let ar = parse(
            "example.com; spf=pass smtp.mailfrom=x@example.net; dkim=fail header.d=example.org",
        );
        assert_eq!(ar.results.len(), 2);
        assert_eq!(
            ar.encode_value(),
            "example.com; spf=pass smtp.mailfrom=x@example.net;\r\n\tdkim=fail header.d=example.org"
        );
    }

    #[test]
    fn parse_emit_parse_is_identity() {
        let inputs = [
            "example.com; spf=pass smtp.mailfrom=sender@example.net",
            "example.com; dkim=pass (comment dropped) header.d=example.com",
            "example.com; spf=fail reason=\"moved\" (see logs) smtp.mailfrom=x@example.net",
            "example.com;\r\n\tdnswl=pass dns.zone=list.dnswl.org policy.ip=127.0.10.1",
            "example.com; arc=pass header.oldest-pass=0 smtp.remote-ip=127.0.0.1",
            "example.com; none",
        ];
        for input in inputs {
            let first = parse(input);
            let emitted = first.encode_value();
            let second = parse(&emitted);
            assert_eq!(first.results, second.results, "for input {input:?}");
            assert_eq!(emitted, second.encode_value(), "for input {input:?}");
        }
    }
}
