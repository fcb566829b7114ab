//! Event and request traits plus the macros that implement them.

use std::any::Any;

/// A message dispatched through the [`EventBus`](crate::EventBus).
///
/// Every event carries a `handled` flag that subscribers may set. The flag
/// does not stop dispatch; it is what `send` reports back to the sender.
pub trait Event: Any + Send + 'static {
    fn is_handled(&self) -> bool;
    fn set_handled(&mut self, handled: bool);

    /// Short type name used in log output.
    fn event_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// An event with a typed result slot.
///
/// By convention exactly one subscriber answers a request: it calls
/// `set_result` and marks the event handled. The bus does not enforce this.
pub trait Request: Event {
    type Output: Send + 'static;

    fn set_result(&mut self, value: Self::Output);
    fn result(&self) -> Option<&Self::Output>;
    fn take_result(&mut self) -> Option<Self::Output>;
}

/// Declares an event struct.
///
/// A public `handled: bool` field, a `new` constructor taking the declared
/// fields in order, and the [`Event`] impl are generated.
///
/// ```ignore
/// define_event! {
///     /// Sent once per simulation tick.
///     pub struct Tick { pub t: u32 }
/// }
///
/// let tick = Tick::new(1);
/// assert!(!tick.handled);
/// ```
#[macro_export]
macro_rules! define_event {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($(#[$fmeta:meta])* $fvis:vis $field:ident : $fty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $($(#[$fmeta])* $fvis $field: $fty,)*
            /// Set by a subscriber once the event has been dealt with
            pub handled: bool,
        }

        impl $name {
            #[allow(clippy::new_without_default, clippy::too_many_arguments)]
            pub fn new($($field: $fty),*) -> Self {
                Self {
                    $($field,)*
                    handled: false,
                }
            }
        }

        impl $crate::Event for $name {
            fn is_handled(&self) -> bool {
                self.handled
            }

            fn set_handled(&mut self, handled: bool) {
                self.handled = handled;
            }

            fn event_name(&self) -> &'static str {
                stringify!($name)
            }
        }
    };
}

/// Declares a request event whose answer has type `$out`.
///
/// ```ignore
/// define_request! {
///     pub struct GetMousePositionRequest -> MousePosition { pub window: Uid }
/// }
/// ```
#[macro_export]
macro_rules! define_request {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident -> $out:ty {
            $($(#[$fmeta:meta])* $fvis:vis $field:ident : $fty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $($(#[$fmeta])* $fvis $field: $fty,)*
            /// Answer written by the responding subscriber
            pub result: Option<$out>,
            /// Set by the responding subscriber
            pub handled: bool,
        }

        impl $name {
            #[allow(clippy::new_without_default, clippy::too_many_arguments)]
            pub fn new($($field: $fty),*) -> Self {
                Self {
                    $($field,)*
                    result: None,
                    handled: false,
                }
            }
        }

        impl $crate::Event for $name {
            fn is_handled(&self) -> bool {
                self.handled
            }

            fn set_handled(&mut self, handled: bool) {
                self.handled = handled;
            }

            fn event_name(&self) -> &'static str {
                stringify!($name)
            }
        }

        impl $crate::Request for $name {
            type Output = $out;

            fn set_result(&mut self, value: Self::Output) {
                self.result = Some(value);
            }

            fn result(&self) -> Option<&Self::Output> {
                self.result.as_ref()
            }

            fn take_result(&mut self) -> Option<Self::Output> {
                self.result.take()
            }
        }
    };
}

/// Downcasts an erased event reference.
pub(crate) fn downcast_event<E: Event>(event: &mut dyn Any) -> Option<&mut E> {
    event.downcast_mut::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::define_event! {
        /// Test event
        pub struct Moved {
            pub x: i32,
            pub y: i32,
        }
    }

    crate::define_event! {
        pub struct Empty {}
    }

    crate::define_request! {
        pub struct Lookup -> String {
            pub key: u32,
        }
    }

    #[test]
    fn test_define_event_generates_constructor() {
        let mut moved = Moved::new(3, 4);
        assert_eq!((moved.x, moved.y), (3, 4));
        assert!(!moved.is_handled());

        moved.set_handled(true);
        assert!(moved.handled);
        assert_eq!(moved.event_name(), "Moved");

        let empty = Empty::new();
        assert!(!empty.is_handled());
    }

    #[test]
    fn test_request_result_slot() {
        let mut lookup = Lookup::new(9);
        assert!(lookup.result().is_none());

        lookup.set_result("nine".to_string());
        assert_eq!(lookup.result().map(String::as_str), Some("nine"));
        // set_result leaves the handled flag to the responder
        assert!(!lookup.is_handled());

        assert_eq!(lookup.take_result().as_deref(), Some("nine"));
        assert!(lookup.result.is_none());
    }

    #[test]
    fn test_downcast_event() {
        let mut moved = Moved::new(1, 2);
        let erased: &mut dyn Any = &mut moved;
        assert!(downcast_event::<Moved>(erased).is_some());

        let erased: &mut dyn Any = &mut moved;
        assert!(downcast_event::<Empty>(erased).is_none());
    }
}
