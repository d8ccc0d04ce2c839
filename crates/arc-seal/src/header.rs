use crate::chain::{ChainStatus, MAX_INSTANCE};
use crate::{parser, ArcError};
use indexmap::map::IndexMap;

/// Folding targets for serialized signature headers: continuation lines
/// aim for 78 columns, base64 runs fold every 72 characters.
const WIDTH: usize = 78;
const B64_WIDTH: usize = 72;

#[derive(Clone, Debug, Default)]
pub struct TaggedHeader {
    tags: IndexMap<String, parser::Tag>,
    raw_bytes: String,
}

impl TaggedHeader {
    pub fn parse(value: &str) -> Result<Self, ArcError> {
        let (_, tags) =
            parser::tag_list(value).map_err(|err| ArcError::SignatureSyntaxError(err.to_string()))?;

        let mut tags_map = IndexMap::new();
        for tag in &tags {
            if tags_map.insert(tag.name.clone(), tag.clone()).is_some() {
                return Err(ArcError::DuplicateTag(tag.name.clone()));
            }
        }
        Ok(Self {
            tags: tags_map,
            raw_bytes: value.to_owned(),
        })
    }

    pub fn get_tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(|v| v.value.as_str())
    }

    pub fn get_raw_tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(|v| v.raw_value.as_str())
    }

    pub fn get_required_tag(&self, name: &str) -> &str {
        // Required tags are guaranteed by the parsing entry points to be
        // present so it's safe to assert here.
        match self.get_tag(name) {
            Some(value) => value,
            None => panic!("required tag {name} is not present"),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw_bytes
    }

    pub fn arc_instance(&self) -> Result<u8, ArcError> {
        let instance = self
            .get_tag("i")
            .ok_or(ArcError::SignatureMissingRequiredTag("i"))?
            .parse::<u8>()
            .map_err(|_| ArcError::InvalidInstance)?;

        if instance == 0 || instance > MAX_INSTANCE {
            return Err(ArcError::InvalidInstance);
        }

        Ok(instance)
    }

    /// Generate the folded header value from the tags.
    fn serialize(&self) -> String {
        let mut lines: Vec<String> = vec![];
        let mut line = String::new();

        for (key, tag) in &self.tags {
            let value = &tag.value;

            // Always emit b, bh and h on a separate line for the sake of
            // consistency of the hash, which is generated in two passes;
            // the first with an empty b value and the second with it
            // populated. If b stayed on a shared line, the two passes
            // could wrap differently and the signature would be invalid.
            let always_new_line = key == "b" || key == "bh" || key == "h";

            if always_new_line || (line.len() + key.len() + 2 + value.len() >= WIDTH) {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
            }

            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(key);
            line.push('=');

            if key == "b" || key == "bh" {
                for (idx, chunk) in value.as_bytes().chunks(B64_WIDTH).enumerate() {
                    if idx > 0 {
                        lines.push(std::mem::take(&mut line));
                    }
                    line.push_str(std::str::from_utf8(chunk).expect("base64 is ASCII"));
                }
            } else if line.len() + value.len() < WIDTH {
                line.push_str(value);
            } else if key == "h" {
                for (idx, name) in value.split(':').enumerate() {
                    if idx > 0 {
                        line.push(':');
                    }
                    if line.len() + name.len() < WIDTH {
                        line.push_str(name);
                        continue;
                    }

                    lines.push(std::mem::take(&mut line));
                    line.push_str(name);
                }
            } else if value.len() >= WIDTH {
                // Value will never fit even on a fresh line,
                // so we force it to break
                for c in value.chars() {
                    line.push(c);
                    if line.len() >= WIDTH {
                        lines.push(std::mem::take(&mut line));
                    }
                }
            } else {
                lines.push(std::mem::take(&mut line));
                line.push_str(value);
            }

            line.push(';');
        }

        if !line.is_empty() {
            lines.push(line);
        }

        lines.join("\r\n\t")
    }
}

#[derive(Clone)]
pub(crate) struct TaggedHeaderBuilder {
    header: TaggedHeader,
}

impl TaggedHeaderBuilder {
    pub(crate) fn new() -> Self {
        TaggedHeaderBuilder {
            header: TaggedHeader::default(),
        }
    }

    pub(crate) fn add_tag(mut self, name: &str, value: &str) -> Self {
        let tag = parser::Tag {
            name: name.to_owned(),
            value: value.to_owned(),
            raw_value: value.to_owned(),
        };
        self.header.tags.insert(name.to_owned(), tag);

        self
    }

    pub(crate) fn set_time(self, timestamp: i64) -> Self {
        self.add_tag("t", &timestamp.to_string())
    }

    pub(crate) fn build(mut self) -> TaggedHeader {
        self.header.raw_bytes = self.header.serialize();
        self.header
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc8617#section-4.1.2>:
/// the AMS header field has the same syntax and semantics as the
/// DKIM-Signature field, except for the name of the field, the absent
/// version tag, and the instance tag replacing the AUID tag.
#[derive(Debug, Clone, Default)]
pub struct ArcMessageSignatureHeader {
    tagged: TaggedHeader,
}

impl std::ops::Deref for ArcMessageSignatureHeader {
    type Target = TaggedHeader;
    fn deref(&self) -> &TaggedHeader {
        &self.tagged
    }
}

impl ArcMessageSignatureHeader {
    pub fn parse(value: &str) -> Result<Self, ArcError> {
        let tagged = TaggedHeader::parse(value)?;
        let header = Self { tagged };

        header.validate_required_tags()?;
        header.arc_instance()?;

        // Check that the "h=" tag includes the From header
        if !header
            .get_required_tag("h")
            .split(':')
            .any(|h| h.trim().eq_ignore_ascii_case("from"))
        {
            return Err(ArcError::FromFieldNotSigned);
        }

        Ok(header)
    }

    fn validate_required_tags(&self) -> Result<(), ArcError> {
        const REQUIRED_TAGS: &[&str] = &["a", "b", "bh", "d", "h", "s", "i"];
        for required in REQUIRED_TAGS {
            if self.get_tag(required).is_none() {
                return Err(ArcError::SignatureMissingRequiredTag(required));
            }
        }
        Ok(())
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc8617#section-4.1.3>
#[derive(Debug, Clone, Default)]
pub struct ArcSealHeader {
    tagged: TaggedHeader,
}

impl std::ops::Deref for ArcSealHeader {
    type Target = TaggedHeader;
    fn deref(&self) -> &TaggedHeader {
        &self.tagged
    }
}

impl ArcSealHeader {
    pub fn parse(value: &str) -> Result<Self, ArcError> {
        let tagged = TaggedHeader::parse(value)?;
        let header = Self { tagged };

        header.validate_required_tags()?;
        header.arc_instance()?;
        header.chain_status()?;

        // A seal carries no header list; its presence MUST result in a
        // cv status of fail, see RFC8617 section 5.1.1
        if header.get_tag("h").is_some() {
            return Err(ArcError::UnacceptableSignatureHeader);
        }

        Ok(header)
    }

    pub fn chain_status(&self) -> Result<ChainStatus, ArcError> {
        self.get_required_tag("cv").parse()
    }

    fn validate_required_tags(&self) -> Result<(), ArcError> {
        const REQUIRED_TAGS: &[&str] = &["a", "b", "d", "s", "i", "cv"];
        for required in REQUIRED_TAGS {
            if self.get_tag(required).is_none() {
                return Err(ArcError::SignatureMissingRequiredTag(required));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_builder() {
        let header = TaggedHeaderBuilder::new()
            .add_tag("i", "1")
            .add_tag("a", "rsa-sha256")
            .build();
        k9::snapshot!(header.raw(), "i=1; a=rsa-sha256;");
    }

    #[test]
    fn test_header_builder_time() {
        let header = TaggedHeaderBuilder::new().set_time(1609459201).build();
        k9::snapshot!(header.raw(), "t=1609459201;");
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        assert_eq!(
            TaggedHeader::parse("i=1; cv=none; i=2").unwrap_err(),
            ArcError::DuplicateTag("i".to_string())
        );
    }

    #[test]
    fn test_parse_ams() {
        let sig = "i=1; a=rsa-sha256; c=relaxed/relaxed; d=
    messagingengine.com; h=date:from:reply-to:to:message-id:subject
    :mime-version:content-type:content-transfer-encoding; s=fm3; t=
    1761717439; bh=+BM/Umiva3F0xjsh9a2BcwzO1nr0Ru6oGRmgkMy9T3M=; b=I
    M7xjn2qSjOx5fDFvQY+pEPJ74+w3h/UOZUKvdAt7gRP8rAe9C+Tz72izVJyY82xw
    7LT7CBXnwk2DQpg9erhq1yYept4M5CKWLXoQHHUJam8mV4RMUnHgTLVlColIVUtY
    hNAomZdsGNiG1iRGX0C4y81zYANJ11TXKOTvfuMLhG2uDIa8768O5jBa4jlBtGHd
    Dn/87/T/J+plO/ZPiSwWKa+ZttR6yjwm0fdpXf+4y8u0+I8iYSw2EN0vgWMYEEMp
    R1xuhMKD+bSlx130Rz2/5jFsVgLS7CfbTKK5CtqS3hl6EaLw/REBZeCYCHltzRWF
    wt38/NIzJ3ykCswwds2YQ==";
        let ams = ArcMessageSignatureHeader::parse(sig).unwrap();
        assert_eq!(ams.arc_instance().unwrap(), 1);
        assert_eq!(ams.get_required_tag("d"), "messagingengine.com");
    }

    #[test]
    fn test_parse_ams_missing_from() {
        let sig = "i=1; a=rsa-sha256; d=example.com; s=sel; h=to:subject; bh=aGFzaA==; b=c2ln";
        assert_eq!(
            ArcMessageSignatureHeader::parse(sig).unwrap_err(),
            ArcError::FromFieldNotSigned
        );
    }

    #[test]
    fn test_parse_seal() {
        let seal = "i=1; a=rsa-sha256; cv=none; d=messagingengine.com; s=fm3; t=
    1761717439; b=Q1E9HuR4H0paxIiz15H8P3tGfzDp0XmYKhvyzGsPEBHr2xg610
    ZV1nU6gLWmUl693usMKVxWGrIXbSZb13ICRK0gp1MfVJSQ/4IGM0VD9P5d9Vv7aL
    Q/lx/a8Ar1ks1yEHeBRuZ6Q5GdYur8rgYr7UoOTJGwOOPTJ4C2TWGoHHIRoVECJv
    mMa6jpcJ6SE6iK/76elugk65BheumbQ1YEnbjitchUsLAwSXMuO+mhLYGtmvBhOn
    v3ewYQvD2jZzl2W+O73A08dQ/oeODDPqt6Fpv3XK572cTYPHhzmSbsxh9Lp7Z9MV
    x2TACmO51Adnp3C1CcEw8K9ajAgyjNMW4ELA==";
        let seal = ArcSealHeader::parse(seal).unwrap();
        assert_eq!(seal.chain_status().unwrap(), ChainStatus::None);
    }

    #[test]
    fn test_parse_seal_rejects_header_list() {
        let seal = "i=1; a=rsa-sha256; cv=none; d=example.com; s=sel; h=from; b=c2ln";
        assert_eq!(
            ArcSealHeader::parse(seal).unwrap_err(),
            ArcError::UnacceptableSignatureHeader
        );
    }

    #[test]
    fn test_parse_seal_invalid_instance() {
        let seal = "i=51; a=rsa-sha256; cv=none; d=example.com; s=sel; b=c2ln";
        assert_eq!(
            ArcSealHeader::parse(seal).unwrap_err(),
            ArcError::InvalidInstance
        );
    }

    #[test]
    fn test_serialize_folds_b() {
        let b64: String = std::iter::repeat('A').take(180).collect();
        let header = TaggedHeaderBuilder::new()
            .add_tag("i", "1")
            .add_tag("a", "rsa-sha256")
            .add_tag("cv", "none")
            .add_tag("d", "example.com")
            .add_tag("s", "elpmaxe")
            .set_time(1234567890)
            .add_tag("b", &b64)
            .build();
        let expected = format!(
            "i=1; a=rsa-sha256; cv=none; d=example.com; s=elpmaxe; t=1234567890;\
             \r\n\tb={}\r\n\t{}\r\n\t{};",
            "A".repeat(72),
            "A".repeat(72),
            "A".repeat(36)
        );
        assert_eq!(header.raw(), expected);

        // Every produced line stays within the fold width
        for line in header.raw().split("\r\n") {
            assert!(line.len() <= WIDTH, "line too long: {line}");
        }

        // and the folded form round-trips
        let parsed = TaggedHeader::parse(header.raw()).unwrap();
        assert_eq!(parsed.get_tag("b").unwrap(), b64);
        assert_eq!(parsed.get_tag("t").unwrap(), "1234567890");
    }

    #[test]
    fn test_serialize_is_deterministic() {
        let build = || {
            TaggedHeaderBuilder::new()
                .add_tag("i", "2")
                .add_tag("a", "rsa-sha256")
                .add_tag("c", "relaxed/relaxed")
                .add_tag("d", "example.com")
                .add_tag("s", "elpmaxe")
                .set_time(1234567890)
                .add_tag("h", "from:subject:to:date:message-id:content-type:from")
                .add_tag("bh", "ecGWgWCJeWxJFeM0urOVWP+KOlqqvsQYKOpYUP8nk7I=")
                .add_tag("b", "")
                .build()
        };
        assert_eq!(build().raw(), build().raw());
    }
}
