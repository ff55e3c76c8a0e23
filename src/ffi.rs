//! FFI (Foreign Function Interface) bindings for the host loader hook.
//!
//! The host's module loader lives outside Rust (a JavaScript runtime or a
//! native shell). It creates an engine, hands it rule definitions as JSON and
//! then calls `patchcord_engine_intercept` for every module it defines.
//!
//! # Memory Management
//!
//! - Rust allocates the engine and every returned string
//! - The caller MUST release them with `patchcord_engine_free` and
//!   `patchcord_free_string`
//! - Strings are null-terminated UTF-8
//!
//! # Usage from C
//!
//! ```c
//! PatchEngineHandle *engine = patchcord_engine_new(NULL);
//! patchcord_engine_add_rules(engine, rules_json);
//!
//! char *patched = patchcord_engine_intercept(engine, "4821", source);
//! /* evaluate patched ... */
//! patchcord_free_string(patched);
//!
//! char *report = patchcord_engine_finish_load(engine);
//! patchcord_free_string(report);
//! patchcord_engine_free(engine);
//! ```

use crate::config::EngineConfig;
use crate::patcher::PatchEngine;
use crate::schema::parse_rules_json;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use tracing::error;

/// Opaque handle to a patch engine.
pub struct PatchEngineHandle {
    engine: PatchEngine,
}

// ============================================================================
// Engine
// ============================================================================

/// Create an engine. `config_toml` may be null for the default config.
/// Returns null if the config does not parse.
/// Caller MUST call patchcord_engine_free() when done.
#[no_mangle]
pub extern "C" fn patchcord_engine_new(config_toml: *const c_char) -> *mut PatchEngineHandle {
    let config = if config_toml.is_null() {
        EngineConfig::default()
    } else {
        let Some(content) = (unsafe { c_char_to_str(config_toml) }) else {
            return ptr::null_mut();
        };
        match EngineConfig::from_toml_str(content) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Invalid engine config");
                return ptr::null_mut();
            }
        }
    };

    Box::into_raw(Box::new(PatchEngineHandle {
        engine: PatchEngine::new(config),
    }))
}

/// Register rules from a JSON rule definition document.
/// Returns the number of rules added, or -1 on error (nothing is added).
#[no_mangle]
pub extern "C" fn patchcord_engine_add_rules(engine: *mut PatchEngineHandle, rules_json: *const c_char) -> c_int {
    if engine.is_null() || rules_json.is_null() {
        return -1;
    }

    unsafe {
        let Some(json) = c_char_to_str(rules_json) else {
            return -1;
        };
        match parse_rules_json(json) {
            Ok(rules) => {
                let count = rules.len();
                let handle = &mut *engine;
                for (plugin, rule) in rules {
                    handle.engine.add_patch(&plugin, rule);
                }
                count as c_int
            }
            Err(e) => {
                error!(error = %e, "Invalid rule definitions");
                -1
            }
        }
    }
}

/// Patch one module's source.
/// Returns the patched source, or null on invalid arguments.
/// Caller MUST call patchcord_free_string() when done.
#[no_mangle]
pub extern "C" fn patchcord_engine_intercept(
    engine: *mut PatchEngineHandle,
    module_id: *const c_char,
    source: *const c_char,
) -> *mut c_char {
    if engine.is_null() || module_id.is_null() || source.is_null() {
        return ptr::null_mut();
    }

    unsafe {
        let (Some(module_id), Some(source)) = (c_char_to_str(module_id), c_char_to_str(source)) else {
            return ptr::null_mut();
        };
        let handle = &mut *engine;
        string_to_c_char(&handle.engine.intercept(module_id, source))
    }
}

/// Report of the load as JSON.
/// Caller MUST call patchcord_free_string() when done.
#[no_mangle]
pub extern "C" fn patchcord_engine_finish_load(engine: *const PatchEngineHandle) -> *mut c_char {
    if engine.is_null() {
        return ptr::null_mut();
    }

    let report = unsafe { (*engine).engine.finish_load() };
    match serde_json::to_string(&report) {
        Ok(json) => string_to_c_char(&json),
        Err(e) => {
            error!(error = %e, "Failed to serialize load report");
            ptr::null_mut()
        }
    }
}

/// Free an engine returned by patchcord_engine_new().
#[no_mangle]
pub extern "C" fn patchcord_engine_free(engine: *mut PatchEngineHandle) {
    if !engine.is_null() {
        unsafe {
            let _ = Box::from_raw(engine);
        }
    }
}

// ============================================================================
// String Management
// ============================================================================

/// Free a string returned by FFI functions.
#[no_mangle]
pub extern "C" fn patchcord_free_string(s: *mut c_char) {
    free_c_char(s);
}

// ============================================================================
// Helper Functions
// ============================================================================

/// # Safety
/// `s` must be a valid null-terminated string that outlives the result.
unsafe fn c_char_to_str<'a>(s: *const c_char) -> Option<&'a str> {
    CStr::from_ptr(s).to_str().ok()
}

fn string_to_c_char(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(c_str) => c_str.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn free_c_char(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            let _ = CString::from_raw(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn test_engine_round_trip() {
        let engine = patchcord_engine_new(ptr::null());
        assert!(!engine.is_null());

        let rules = c(r#"[{"plugin": "A", "patches": [
            {"find": "return null", "replacement": {"match": {"regex": "return null"}, "replace": "return 42"}}
        ]}]"#);
        assert_eq!(patchcord_engine_add_rules(engine, rules.as_ptr()), 1);

        let id = c("1");
        let source = c("function(e){return null}");
        let patched = patchcord_engine_intercept(engine, id.as_ptr(), source.as_ptr());
        let text = unsafe { CStr::from_ptr(patched) }.to_str().unwrap().to_string();
        assert_eq!(text, "function(e){return 42}");
        patchcord_free_string(patched);

        let report = patchcord_engine_finish_load(engine);
        let json: serde_json::Value =
            serde_json::from_str(unsafe { CStr::from_ptr(report) }.to_str().unwrap()).unwrap();
        assert_eq!(json["failures"].as_array().map(Vec::len), Some(0));
        patchcord_free_string(report);

        patchcord_engine_free(engine);
    }

    #[test]
    fn test_null_arguments() {
        assert_eq!(patchcord_engine_add_rules(ptr::null_mut(), ptr::null()), -1);
        assert!(patchcord_engine_intercept(ptr::null_mut(), ptr::null(), ptr::null()).is_null());
        assert!(patchcord_engine_finish_load(ptr::null()).is_null());
        patchcord_engine_free(ptr::null_mut());
        patchcord_free_string(ptr::null_mut());
    }

    #[test]
    fn test_bad_config_and_rules() {
        let config = c("environment = 3");
        assert!(patchcord_engine_new(config.as_ptr()).is_null());

        let engine = patchcord_engine_new(ptr::null());
        let rules = c("not json");
        assert_eq!(patchcord_engine_add_rules(engine, rules.as_ptr()), -1);
        patchcord_engine_free(engine);
    }
}
