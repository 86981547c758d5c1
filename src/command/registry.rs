//! Tag-to-factory table for decoding command frames.
//!
//! Command modules contribute their registrations through the distributed
//! slice; the populated table is built once at process start and never
//! changes afterwards, so decoding needs no synchronization.

use crate::command::Command;
use crate::core::errors::ProtocolError;
use crate::wire::ReadStream;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::warn;

/// Zero-argument constructor for an empty command of one tag
pub type CommandFactory = fn() -> Box<dyn Command>;

/// Registration hook contributed by each command module
#[linkme::distributed_slice]
pub static COMMAND_CATALOG: [fn(&mut CommandRegistry)] = [..];

/// Decoder table mapping wire tags to command factories.
///
/// Registration requires `&mut self`, so a shared registry is read-only by
/// construction once it leaves `with_builtin_commands`.
pub struct CommandRegistry {
    factories: HashMap<u64, CommandFactory>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry populated with every link-time registration
    pub fn with_builtin_commands() -> Self {
        let mut registry = Self::new();
        for register in COMMAND_CATALOG {
            register(&mut registry);
        }
        registry
    }

    pub fn register(&mut self, tag: u64, factory: CommandFactory) {
        if self.factories.insert(tag, factory).is_some() {
            warn!(tag, "command tag registered twice, keeping the last factory");
        }
    }

    pub fn contains(&self, tag: u64) -> bool {
        self.factories.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Decode one complete frame into a runnable command.
    ///
    /// The tag is resolved before any body byte is touched, and the body
    /// must account for the whole remainder of the frame.
    pub fn decode(&self, frame: Bytes) -> Result<Box<dyn Command>, ProtocolError> {
        let mut r = ReadStream::new(frame);
        let tag = r.read_u64()?;
        let factory = self
            .factories
            .get(&tag)
            .ok_or(ProtocolError::UnknownTag { tag })?;
        let mut command = factory();
        command.deserialize(&mut r)?;
        if r.remaining() > 0 {
            return Err(ProtocolError::TrailingBytes {
                tag,
                trailing: r.remaining(),
            });
        }
        Ok(command)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtin_commands()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{encode_command, tags};
    use crate::handle::Handle;
    use crate::object::ObjectKind;
    use crate::wire::WriteStream;
    use pretty_assertions::assert_eq;

    #[test]
    fn builtin_registry_covers_the_full_catalog() {
        let registry = CommandRegistry::with_builtin_commands();
        assert_eq!(registry.len(), 19);
        for tag in 1..=19u64 {
            assert!(registry.contains(tag), "missing tag {tag}");
        }
    }

    #[test]
    fn commands_survive_an_encode_decode_cycle() {
        let registry = CommandRegistry::with_builtin_commands();
        let command = crate::command::construct::NewObject::new(
            ObjectKind::Renderer,
            "scivis",
            Handle::from_raw(9),
        );

        let decoded = registry.decode(encode_command(&command).unwrap()).unwrap();
        assert_eq!(decoded.tag(), tags::NEW_OBJECT);
        assert_eq!(decoded.name(), "new_object");
    }

    #[test]
    fn unknown_tags_are_rejected_before_the_body() {
        let registry = CommandRegistry::with_builtin_commands();
        let mut w = WriteStream::new();
        w.write_u64(999);
        w.write_u32(0xdead_beef);

        match registry.decode(w.into_bytes()) {
            Err(ProtocolError::UnknownTag { tag }) => assert_eq!(tag, 999),
            other => panic!("expected unknown tag, got {other:?}"),
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let registry = CommandRegistry::with_builtin_commands();
        assert!(matches!(
            registry.decode(Bytes::from_static(&[1, 2, 3])),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn undeclared_trailing_bytes_are_rejected() {
        let registry = CommandRegistry::with_builtin_commands();
        let mut frame =
            Vec::from(encode_command(&crate::command::lifecycle::CommandFinalize).unwrap());
        frame.push(0);

        match registry.decode(Bytes::from(frame)) {
            Err(ProtocolError::TrailingBytes { tag, trailing }) => {
                assert_eq!(tag, tags::FINALIZE);
                assert_eq!(trailing, 1);
            }
            other => panic!("expected trailing bytes, got {other:?}"),
        }
    }
}
