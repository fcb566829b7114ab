//! The plugin registration macro.

/// Exports the entry points the host looks for in a plugin module.
///
/// The plugin type needs a `new()` constructor and a [`Plugin`] impl.
///
/// `register_plugin!(MyPlugin)` emits `create_plugin`, `destroy_plugin` and
/// `tbx_plugin_api_version` with C linkage, for use in a `cdylib`.
///
/// `register_plugin!(MyPlugin as my_plugin)` emits the same functions inside
/// a module `my_plugin` without unmangled names, plus `my_plugin::exports()`.
/// That form is for plugins linked straight into the host, and lets several
/// plugins live in one binary.
///
/// Panics in the constructor or destructor are caught at the boundary: a
/// failed construction returns null, which the host reports and skips.
///
/// ```ignore
/// struct Sandbox;
///
/// impl Sandbox {
///     fn new() -> Self {
///         Sandbox
///     }
/// }
///
/// impl Plugin for Sandbox {
///     fn on_load(&self, context: &Arc<PluginContext>) -> Result<(), PluginError> {
///         context.log(LogLevel::Info, "sandbox ready");
///         Ok(())
///     }
/// }
///
/// register_plugin!(Sandbox);
/// ```
///
/// [`Plugin`]: crate::Plugin
#[macro_export]
macro_rules! register_plugin {
    (@functions $plugin_type:ty, $(#[$attr:meta])*) => {
        /// Creates the plugin instance. Returns null if construction panicked.
        ///
        /// # Safety
        ///
        /// The returned pointer must be released with `destroy_plugin` from
        /// the same module.
        $(#[$attr])*
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C" fn create_plugin() -> *mut dyn $crate::Plugin {
            match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                let plugin: ::std::boxed::Box<dyn $crate::Plugin> =
                    ::std::boxed::Box::new(<$plugin_type>::new());
                ::std::boxed::Box::into_raw(plugin)
            })) {
                Ok(plugin) => plugin,
                Err(_) => ::std::ptr::null_mut::<$plugin_type>() as *mut dyn $crate::Plugin,
            }
        }

        /// Destroys an instance returned by `create_plugin`.
        ///
        /// # Safety
        ///
        /// `plugin` must come from this module's `create_plugin` and must not
        /// be used afterwards.
        $(#[$attr])*
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C" fn destroy_plugin(plugin: *mut dyn $crate::Plugin) {
            if plugin.is_null() {
                return;
            }
            // A panicking destructor leaks the object rather than unwinding
            // into the host.
            let _ = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                drop(::std::boxed::Box::from_raw(plugin));
            }));
        }

        /// Plugin API version this module was built against.
        $(#[$attr])*
        pub extern "C" fn tbx_plugin_api_version() -> u32 {
            $crate::PLUGIN_API_VERSION
        }
    };

    ($plugin_type:ty) => {
        $crate::register_plugin!(@functions $plugin_type, #[no_mangle]);
    };

    ($plugin_type:ty as $module:ident) => {
        pub mod $module {
            #[allow(unused_imports)]
            use super::*;

            $crate::register_plugin!(@functions $plugin_type,);

            /// Entry points of this statically linked plugin.
            pub fn exports() -> $crate::PluginExports {
                $crate::PluginExports {
                    create: create_plugin,
                    destroy: destroy_plugin,
                    api_version: tbx_plugin_api_version,
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::{Plugin, PluginContext, PluginError, PLUGIN_API_VERSION};
    use std::cell::RefCell;
    use std::sync::Arc;

    thread_local! {
        static EVENTS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    }

    pub struct Sample;

    impl Sample {
        fn new() -> Self {
            EVENTS.with(|events| events.borrow_mut().push("new"));
            Sample
        }
    }

    impl Drop for Sample {
        fn drop(&mut self) {
            EVENTS.with(|events| events.borrow_mut().push("drop"));
        }
    }

    impl Plugin for Sample {
        fn on_load(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
            Ok(())
        }
    }

    pub struct Exploding;

    impl Exploding {
        fn new() -> Self {
            panic!("constructor failed")
        }
    }

    impl Plugin for Exploding {
        fn on_load(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
            Ok(())
        }
    }

    crate::register_plugin!(Sample as sample_exports);
    crate::register_plugin!(Exploding as exploding_exports);

    #[test]
    fn test_static_exports_create_and_destroy() {
        let exports = sample_exports::exports();
        assert_eq!((exports.api_version)(), PLUGIN_API_VERSION);

        let plugin = unsafe { (exports.create)() };
        assert!(!plugin.is_null());
        unsafe { (exports.destroy)(plugin) };

        EVENTS.with(|events| assert_eq!(*events.borrow(), vec!["new", "drop"]));
    }

    #[test]
    fn test_panicking_constructor_returns_null() {
        let exports = exploding_exports::exports();
        let plugin = unsafe { (exports.create)() };
        assert!(plugin.is_null());
        // Destroying null is a no-op
        unsafe { (exports.destroy)(plugin) };
    }
}
