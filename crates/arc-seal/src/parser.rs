use crate::{canonicalization, hash, ArcError};
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::alpha1;
use nom::combinator::opt;
use nom::multi::fold_many0;
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::IResult;

#[derive(Clone, Debug, PartialEq)]
/// One tag of an ARC-Seal, ARC-Message-Signature or public key record
pub struct Tag {
    /// Name of the tag (i, a, cv, ...)
    pub name: String,
    /// Value of the tag with folding whitespace removed
    pub value: String,
    /// Value of the tag as it appeared in the text, folds included
    pub raw_value: String,
}

/// Main entrypoint of the parser. Parses the tag list carried by the
/// ARC header fields and by key records; RFC8617 imports the syntax
/// from <https://datatracker.ietf.org/doc/html/rfc6376#section-3.2>.
/// tag-list  =  tag-spec *( ";" tag-spec ) [ ";" ]
pub fn tag_list(input: &str) -> IResult<&str, Vec<Tag>> {
    let (input, start) = tag_spec(input)?;

    terminated(
        fold_many0(
            preceded(tag(";"), tag_spec),
            move || vec![start.clone()],
            |mut acc: Vec<Tag>, item| {
                acc.push(item);
                acc
            },
        ),
        opt(tag(";")),
    )(input)
}

/// tag-spec  =  [FWS] tag-name [FWS] "=" [FWS] tag-value [FWS]
fn tag_spec(input: &str) -> IResult<&str, Tag> {
    let (input, name) = delimited(opt(fws), tag_name, opt(fws))(input)?;
    let (input, _) = tag("=")(input)?;
    let (input, (value, raw_value)) = delimited(opt(fws), tag_value, opt(fws))(input)?;

    Ok((
        input,
        Tag {
            name: name.to_owned(),
            value,
            raw_value,
        },
    ))
}

/// tag-name  =  ALPHA *ALNUMPUNC
/// Every tag in the headers and records we handle is plain ALPHA.
fn tag_name(input: &str) -> IResult<&str, &str> {
    alpha1(input)
}

/// tag-value =  [ tval *( 1*(WSP / FWS) tval ) ]
/// tval      =  1*VALCHAR
/// VALCHAR   =  %x21-3A / %x3C-7E
///
/// Produces both the FWS-stripped value and the text as received:
/// blanking a `b=` during signature verification has to remove exactly
/// the bytes that appeared in the header, folds included.
fn tag_value(input: &str) -> IResult<&str, (String, String)> {
    let is_valchar = |c| ('!'..=':').contains(&c) || ('<'..='~').contains(&c);
    match opt(take_while1(is_valchar))(input)? {
        (input, Some(start)) => fold_many0(
            pair(fws, take_while1(is_valchar)),
            || (start.to_owned(), start.to_owned()),
            |(mut value, mut raw_value): (String, String), (ws, chunk)| {
                value += chunk;
                raw_value += ws;
                raw_value += chunk;
                (value, raw_value)
            },
        )(input),
        (input, None) => Ok((input, (String::new(), String::new()))),
    }
}

/// FWS is folding whitespace: multiple lines separated by CRLF followed
/// by at least one whitespace may be joined.
fn fws(input: &str) -> IResult<&str, &str> {
    take_while1(|c| c == ' ' || c == '\t' || c == '\r' || c == '\n')(input)
}

/// SHA-256 is the only permitted hash; rsa-sha1 is refused outright.
pub(crate) fn parse_hash_algo(value: &str) -> Result<hash::HashAlgo, ArcError> {
    use hash::HashAlgo;
    match value {
        "rsa-sha256" => Ok(HashAlgo::RsaSha256),
        "ed25519-sha256" => Ok(HashAlgo::Ed25519Sha256),
        e => Err(ArcError::UnsupportedHashAlgorithm(e.to_string())),
    }
}

/// Parses the canonicalization value (passed in c=) and returns
/// canonicalization for (Header, Body)
pub(crate) fn parse_canonicalization(
    value: Option<&str>,
) -> Result<(canonicalization::Type, canonicalization::Type), ArcError> {
    use canonicalization::Type::{Relaxed, Simple};
    match value {
        None => Ok((Simple, Simple)),
        Some(s) => match s {
            "simple/simple" => Ok((Simple, Simple)),
            "relaxed/simple" => Ok((Relaxed, Simple)),
            "simple/relaxed" => Ok((Simple, Relaxed)),
            "relaxed/relaxed" => Ok((Relaxed, Relaxed)),
            "relaxed" => Ok((Relaxed, Simple)),
            "simple" => Ok((Simple, Simple)),
            v => Err(ArcError::UnsupportedCanonicalizationType(v.to_owned())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgo;

    fn get<'a>(tags: &'a [Tag], name: &str) -> &'a Tag {
        tags.iter()
            .find(|tag| tag.name == name)
            .unwrap_or_else(|| panic!("tag {name} not present"))
    }

    #[test]
    fn seal_tag_list() {
        let (rest, tags) = tag_list(
            "i=1; a=rsa-sha256; cv=none; d=example.com; s=elpmaxe; t=1234567890; b=dGVzdA==",
        )
        .unwrap();
        assert_eq!(rest, "");
        assert_eq!(
            tags.iter().map(|tag| tag.name.as_str()).collect::<Vec<_>>(),
            vec!["i", "a", "cv", "d", "s", "t", "b"]
        );
        assert_eq!(get(&tags, "i").value, "1");
        assert_eq!(get(&tags, "cv").value, "none");
        assert_eq!(get(&tags, "d").value, "example.com");
        assert_eq!(get(&tags, "b").value, "dGVzdA==");
    }

    #[test]
    fn folded_signature_value() {
        // a folded b= keeps its raw text: that is what gets blanked when
        // the seal is verified
        let (rest, tags) = tag_list("i=2; cv=pass; b=Q1E9HuR4\r\n\tH0paxIiz").unwrap();
        assert_eq!(rest, "");
        let b = get(&tags, "b");
        assert_eq!(b.value, "Q1E9HuR4H0paxIiz");
        assert_eq!(b.raw_value, "Q1E9HuR4\r\n\tH0paxIiz");
    }

    #[test]
    fn whitespace_around_tags() {
        let (rest, tags) = tag_list(" i = 2 ;\r\n\tcv = pass ;\r\n\ts = elpmaxe").unwrap();
        assert_eq!(rest, "");
        assert_eq!(get(&tags, "i").value, "2");
        assert_eq!(get(&tags, "cv").value, "pass");
        assert_eq!(get(&tags, "s").value, "elpmaxe");
    }

    #[test]
    fn message_signature_header_list() {
        let (rest, tags) = tag_list(
            "i=1; a=ed25519-sha256; c=relaxed/relaxed; d=example.com; s=elpmaxe;\r\n\
             \th=from:subject:to:date:message-id:content-type:from;\r\n\
             \tbh=frcCV1k9oG9oKj3dpUqdJg1PxRT2RSN/XKdLCPjaYaY=;\r\n\
             \tb=",
        )
        .unwrap();
        assert_eq!(rest, "");
        assert_eq!(get(&tags, "c").value, "relaxed/relaxed");
        assert_eq!(
            get(&tags, "h").value,
            "from:subject:to:date:message-id:content-type:from"
        );
        // the blank-b signing pass carries an empty value
        assert_eq!(get(&tags, "b").value, "");
    }

    #[test]
    fn empty_value_and_trailing_semicolon() {
        let (rest, tags) = tag_list("i=1; cv=none; b=;").unwrap();
        assert_eq!(rest, "");
        assert_eq!(get(&tags, "b").value, "");
        assert_eq!(get(&tags, "b").raw_value, "");
    }

    #[test]
    fn key_record() {
        let (rest, tags) = tag_list(
            "v=DKIM1; k=ed25519; h=sha256; p=11qYAYKxCrfVS/7TyWQHOg7hcvPapiMlrwIaaPcHURo=",
        )
        .unwrap();
        assert_eq!(rest, "");
        assert_eq!(get(&tags, "v").value, "DKIM1");
        assert_eq!(get(&tags, "k").value, "ed25519");
        assert_eq!(
            get(&tags, "p").value,
            "11qYAYKxCrfVS/7TyWQHOg7hcvPapiMlrwIaaPcHURo="
        );
    }

    #[test]
    fn hash_algos() {
        assert_eq!(parse_hash_algo("rsa-sha256").unwrap(), HashAlgo::RsaSha256);
        assert_eq!(
            parse_hash_algo("ed25519-sha256").unwrap(),
            HashAlgo::Ed25519Sha256
        );
        assert_eq!(
            parse_hash_algo("rsa-sha1").unwrap_err(),
            ArcError::UnsupportedHashAlgorithm("rsa-sha1".to_string())
        );
    }

    #[test]
    fn canonicalization_modes() {
        use canonicalization::Type::{Relaxed, Simple};

        assert_eq!(parse_canonicalization(None).unwrap(), (Simple, Simple));
        assert_eq!(
            parse_canonicalization(Some("relaxed/relaxed")).unwrap(),
            (Relaxed, Relaxed)
        );
        assert_eq!(
            parse_canonicalization(Some("relaxed")).unwrap(),
            (Relaxed, Simple)
        );
        assert_eq!(
            parse_canonicalization(Some("simple")).unwrap(),
            (Simple, Simple)
        );
        assert!(parse_canonicalization(Some("flat")).is_err());
    }
}
