//! Built-in user-defined functions.

use anyhow::{bail, Result};

use rill_isb::Message;

/// A built-in transform applied between a vertex's read and write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    /// Forward every message unchanged.
    Cat,
    /// Drop messages with an empty payload.
    Filter,
}

impl Builtin {
    /// Apply the function; `None` drops the message, which is still acked.
    pub fn apply(&self, message: Message) -> Option<Message> {
        match self {
            Self::Cat => Some(message),
            Self::Filter => {
                if message.body.payload.is_empty() {
                    None
                } else {
                    Some(message)
                }
            }
        }
    }
}

/// Resolve a built-in function by name.
pub fn resolve(name: &str, _args: &[String]) -> Result<Builtin> {
    match name {
        "" => bail!("function name missing"),
        "cat" => Ok(Builtin::Cat),
        "filter" => Ok(Builtin::Filter),
        other => bail!("unrecognized function {:?}", other),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolution_by_name() {
        assert_eq!(resolve("cat", &[]).expect("cat must resolve"), Builtin::Cat);
        assert_eq!(resolve("filter", &[]).expect("filter must resolve"), Builtin::Filter);
        let err = resolve("", &[]).expect_err("an empty name must be rejected");
        assert!(err.to_string().contains("function name missing"), "unexpected error {:?}", err.to_string());
        let err = resolve("nonono", &[]).expect_err("an unknown name must be rejected");
        assert!(err.to_string().contains("unrecognized function"), "unexpected error {:?}", err.to_string());
    }

    #[test]
    fn cat_forwards_and_filter_drops_empties() {
        let message = Message::new("m1", "payload".as_bytes().to_vec());
        assert!(Builtin::Cat.apply(message.clone()).is_some());
        assert!(Builtin::Filter.apply(message).is_some());
        let empty = Message::new("m2", Vec::new());
        assert!(Builtin::Cat.apply(empty.clone()).is_some());
        assert!(Builtin::Filter.apply(empty).is_none());
    }
}
