/// ARC error status, following the DKIM result vocabulary:
/// a Tempfail error may succeed on retry, a Permfail will not.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Permfail,
    Tempfail,
}

quick_error! {
    #[derive(Debug, PartialEq, Clone)]
    /// ARC errors
    pub enum ArcError {
        UnsupportedHashAlgorithm(value: String) {
            display("unsupported hash algorithm: {}", value)
        }
        UnsupportedCanonicalizationType(value: String) {
            display("unsupported canonicalization: {}", value)
        }
        SignatureSyntaxError(err: String) {
            display("signature syntax error: {}", err)
        }
        SignatureMissingRequiredTag(name: &'static str) {
            display("signature missing required tag ({})", name)
        }
        DuplicateTag(name: String) {
            display("duplicate tag ({})", name)
        }
        UnacceptableSignatureHeader {
            display("unacceptable signature header")
        }
        FromFieldNotSigned {
            display("From field not signed")
        }
        InvalidInstance {
            display("invalid ARC instance")
        }
        DuplicateInstance(instance: u8) {
            display("duplicate ARC instance {}", instance)
        }
        MissingInstance(instance: u8) {
            display("missing ARC instance {}", instance)
        }
        InvalidChainStatus(value: String) {
            display("invalid chain validation status: {}", value)
        }
        KeyUnavailable(err: String) {
            display("key unavailable: {}", err)
        }
        NoKeyForSignature {
            display("no key for signature")
        }
        KeySyntaxError {
            display("key syntax error")
        }
        KeyIncompatibleVersion {
            display("key incompatible version")
        }
        InappropriateKeyAlgorithm {
            display("inappropriate key algorithm")
        }
        InappropriateHashAlgorithm {
            display("inappropriate hash algorithm")
        }
        KeyRevoked {
            display("key revoked")
        }
        KeyTooWeak(bits: usize) {
            display("key too weak: {} bits", bits)
        }
        SignatureDidNotVerify {
            display("signature did not verify")
        }
        BodyHashDidNotVerify {
            display("body hash did not verify")
        }
        PrivateKeyLoadError(err: String) {
            display("failed to load private key: {}", err)
        }
        FailedToSign(err: String) {
            display("failed to sign: {}", err)
        }
        BuilderError(err: &'static str) {
            display("failed to build object: {}", err)
        }
    }
}

impl ArcError {
    pub fn status(&self) -> Status {
        use ArcError::*;
        match self {
            UnsupportedHashAlgorithm(_)
            | UnsupportedCanonicalizationType(_)
            | SignatureSyntaxError(_)
            | SignatureMissingRequiredTag(_)
            | DuplicateTag(_)
            | UnacceptableSignatureHeader
            | FromFieldNotSigned
            | InvalidInstance
            | DuplicateInstance(_)
            | MissingInstance(_)
            | InvalidChainStatus(_)
            | NoKeyForSignature
            | KeySyntaxError
            | KeyIncompatibleVersion
            | InappropriateKeyAlgorithm
            | InappropriateHashAlgorithm
            | KeyRevoked
            | KeyTooWeak(_)
            | SignatureDidNotVerify
            | BodyHashDidNotVerify => Status::Permfail,
            KeyUnavailable(_)
            | PrivateKeyLoadError(_)
            | FailedToSign(_)
            | BuilderError(_) => Status::Tempfail,
        }
    }
}
