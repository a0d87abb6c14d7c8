/// Expand `${ENV_VAR}` placeholders in raw config text.
///
/// Unset variables, empty names and unterminated placeholders are kept
/// verbatim so the parser reports them in context.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match (!name.is_empty()).then(|| lookup(name)).flatten() {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    fn fake(name: &str) -> Option<String> {
        match name {
            "NATS_HOST" => Some("nats.internal".into()),
            "PORT" => Some("4222".into()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_vars() {
        assert_eq!(
            substitute_with("url = \"nats://${NATS_HOST}:${PORT}\"", fake),
            "url = \"nats://nats.internal:4222\""
        );
    }

    #[test]
    fn leaves_unknown_and_empty_placeholders() {
        assert_eq!(substitute_with("${MISSING} ${}", fake), "${MISSING} ${}");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_with("url=${NATS_HOST", fake), "url=${NATS_HOST");
        assert_eq!(substitute_with("cost: $5", fake), "cost: $5");
    }

    #[test]
    fn reads_process_environment() {
        unsafe { std::env::set_var("POTAT_TEST_VAR", "hello") };
        assert_eq!(substitute_env("key=${POTAT_TEST_VAR}"), "key=hello");
        unsafe { std::env::remove_var("POTAT_TEST_VAR") };
    }
}
