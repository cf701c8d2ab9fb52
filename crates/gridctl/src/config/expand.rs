/// Expands `${VAR}` / `${VAR:-default}` / `${VAR:+val}` against the process
/// environment. Used for OpenAPI spec files and server `env` blocks unless the
/// caller passes `--no-expand`.
pub fn expand_env(input: &str) -> Result<String, String> {
    shellexpand::env(input)
        .map(|s| s.into_owned())
        .map_err(|e| format!("environment expansion failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_plain_variable() {
        std::env::set_var("GRIDCTL_TEST_VAR", "hello");
        assert_eq!(expand_env("${GRIDCTL_TEST_VAR}").unwrap(), "hello");
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        std::env::remove_var("GRIDCTL_TEST_UNSET");
        assert_eq!(expand_env("${GRIDCTL_TEST_UNSET:-fallback}").unwrap(), "fallback");
    }
}
