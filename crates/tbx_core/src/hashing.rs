//! Typed hash keys used by the event bus.

use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Hash of a type's identity. Stable for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(pub u64);

/// Identifies one subscribed callback so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackKey(pub u64);

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for CallbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hashes the runtime type identity of `T`.
pub fn type_key<T: ?Sized + 'static>() -> TypeKey {
    let mut hasher = DefaultHasher::new();
    TypeId::of::<T>().hash(&mut hasher);
    TypeKey(hasher.finish())
}

/// Mixes `value` into `seed`.
pub fn hash_combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

/// Key for a free function: the function type's key XOR its address.
pub fn callback_key<F: 'static>(address: usize) -> CallbackKey {
    CallbackKey(type_key::<F>().0 ^ address as u64)
}

/// Key for a method bound to an instance.
///
/// The method type's key is XORed with the instance address. The method
/// address is folded in as well, otherwise two methods with the same
/// signature on one instance would share a key.
pub fn method_key<M: 'static>(instance: usize, method: usize) -> CallbackKey {
    let base = type_key::<M>().0 ^ instance as u64;
    CallbackKey(hash_combine(base, method as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    fn handler_a(value: &mut u32) {
        *value += 1;
    }

    fn handler_b(value: &mut u32) {
        *value *= 2;
    }

    #[test]
    fn test_type_key_stable_per_type() {
        assert_eq!(type_key::<Alpha>(), type_key::<Alpha>());
        assert_ne!(type_key::<Alpha>(), type_key::<Beta>());
        assert_ne!(type_key::<u32>(), type_key::<u64>());
    }

    #[test]
    fn test_callback_key_depends_on_address() {
        let a = callback_key::<fn(&mut u32)>(handler_a as fn(&mut u32) as usize);
        let b = callback_key::<fn(&mut u32)>(handler_b as fn(&mut u32) as usize);
        let a_again = callback_key::<fn(&mut u32)>(handler_a as fn(&mut u32) as usize);

        assert_ne!(a, b);
        assert_eq!(a, a_again);
    }

    #[test]
    fn test_method_key_distinguishes_instances_and_methods() {
        let first = method_key::<fn(&Alpha, &mut u32)>(0x1000, 0x20);
        let other_instance = method_key::<fn(&Alpha, &mut u32)>(0x2000, 0x20);
        let other_method = method_key::<fn(&Alpha, &mut u32)>(0x1000, 0x40);

        assert_ne!(first, other_instance);
        assert_ne!(first, other_method);
        assert_eq!(first, method_key::<fn(&Alpha, &mut u32)>(0x1000, 0x20));
    }
}
