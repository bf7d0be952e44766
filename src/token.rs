/// An opaque identifier associated with a [`Channel`](crate::channel::Channel)
/// when it is registered with a notifier.
///
/// The notifier hands tokens back unchanged in the readiness events it
/// returns; the event loop uses them only to find the channel that
/// corresponds to a given event, never as a client-visible identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Token(pub usize);

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    fn from(token: Token) -> usize {
        token.0
    }
}
