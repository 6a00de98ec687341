//! Environment variables never passed to plugin processes.
//!
//! Plugins inherit the agent environment minus variables that inject code
//! or libraries into the child.

/// Variables stripped from the inherited environment.
const BLOCKED_PLUGIN_ENV: &[&str] = &[
    // Library injection (Linux)
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    // Library injection (macOS)
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    // Interpreter startup injection
    "NODE_OPTIONS",
    "PYTHONSTARTUP",
    "PYTHONPATH",
    "PERL5LIB",
    "RUBYLIB",
    "BASH_ENV",
    "ENV",
    // Java agent injection
    "JAVA_TOOL_OPTIONS",
    "_JAVA_OPTIONS",
    "JDK_JAVA_OPTIONS",
    // OpenSSL engine loading
    "OPENSSL_CONF",
];

/// Prefixes blocked entirely (case-insensitive).
const BLOCKED_PREFIXES: &[&str] = &["ld_", "dyld_"];

/// Returns `true` if `key` must not reach a plugin process.
#[must_use]
pub fn is_blocked_plugin_env(key: &str) -> bool {
    if BLOCKED_PLUGIN_ENV
        .iter()
        .any(|k| k.eq_ignore_ascii_case(key))
    {
        return true;
    }

    let lower = key.to_ascii_lowercase();
    BLOCKED_PREFIXES.iter().any(|p| lower.starts_with(p))
}
