//! Control values returned by bound callbacks.

use bitflags::bitflags;

bitflags! {
    /// What a callback asks the bus to do once the current trigger pass is over.
    ///
    /// Flags from every callback in a pass are OR-ed together into the value
    /// returned by the trigger. Every bound callback always runs; the flags
    /// are only acted upon after the pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Response: u8 {
        /// Remove the binding that returned this.
        const UNBIND_THIS_BINDING = 1;
        /// Remove every binding of the triggered caller for the triggered event.
        const UNBIND_THIS_CALLER = 1 << 1;
    }
}

impl Response {
    /// Nothing to do.
    pub const NONE: Response = Response::empty();
}

impl Default for Response {
    fn default() -> Self {
        Self::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_none() {
        assert_eq!(Response::default(), Response::NONE);
        assert!(Response::NONE.is_empty());
    }

    #[test]
    fn test_flags_combine() {
        let r = Response::NONE | Response::UNBIND_THIS_BINDING | Response::UNBIND_THIS_CALLER;
        assert!(r.contains(Response::UNBIND_THIS_BINDING));
        assert!(r.contains(Response::UNBIND_THIS_CALLER));
        let mut acc = Response::NONE;
        acc |= Response::UNBIND_THIS_BINDING;
        assert!(!acc.contains(Response::UNBIND_THIS_CALLER));
    }
}
