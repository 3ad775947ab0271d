use bitflags::bitflags;

bitflags! {
    /// Opaque token describing what the remote endpoint negotiated during the
    /// preamble. The hub only inspects the chunked and binary bits; the rest
    /// travels with the transport for the runtime to query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u64 {
        /// Remote understands length-prefixed chunked framing.
        const CHUNKED_STREAM = 1 << 0;
        /// Remote speaks the binary transport, not a text fallback.
        const BINARY_STREAM = 1 << 1;
    }
}

impl Capability {
    pub fn supports_chunked_stream(&self) -> bool {
        self.contains(Self::CHUNKED_STREAM)
    }

    pub fn supports_binary_stream(&self) -> bool {
        self.contains(Self::BINARY_STREAM)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queries_follow_bits() {
        assert!(Capability::all().supports_chunked_stream());
        assert!(Capability::all().supports_binary_stream());
        assert!(!Capability::empty().supports_chunked_stream());
        assert!(!Capability::BINARY_STREAM.supports_chunked_stream());
        assert!(Capability::BINARY_STREAM.supports_binary_stream());
    }
}
