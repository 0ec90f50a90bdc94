//! Launch-command resolution for spawned servers.
//!
//! Every platform quirk lives here so the lifecycle code stays OS-agnostic.

/// Resolve a configured command to the executable name the current platform
/// can actually spawn. The npm-family shims are batch files on Windows, so
/// `npx` must become `npx.cmd` there.
pub fn resolve_command(command: &str) -> String {
    #[cfg(windows)]
    {
        const CMD_SHIMS: [&str; 4] = ["npx", "npm", "pnpm", "yarn"];
        if CMD_SHIMS.contains(&command) {
            return format!("{}.cmd", command);
        }
    }
    command.to_string()
}

/// Expand environment variable references like `${VAR}` in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Render a command line for logs, quoting arguments that contain spaces.
pub fn display_command(command: &str, args: &[String]) -> String {
    let mut parts = vec![command.to_string()];
    for arg in args {
        if arg.contains(' ') {
            parts.push(format!("\"{}\"", arg));
        } else {
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}
