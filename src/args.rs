use crate::error::GatewayError;

/// Caps on what a caller may pass to a script.
#[derive(Debug, Clone, Copy)]
pub struct ArgLimits {
    pub max_args: usize,
    pub max_arg_len: usize,
}

/// Parses a request body into script arguments.
///
/// The body is a JSON array of strings. An empty body or `null` means no
/// arguments. Order is preserved and nothing is split or joined.
pub fn parse_arguments(body: &[u8], limits: &ArgLimits) -> Result<Vec<String>, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let args: Option<Vec<String>> = serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidArguments(format!("expected a JSON array of strings: {}", e)))?;
    let args = args.unwrap_or_default();

    if args.len() > limits.max_args {
        return Err(GatewayError::PayloadTooLarge(format!(
            "{} arguments given, at most {} allowed",
            args.len(),
            limits.max_args
        )));
    }
    for (i, arg) in args.iter().enumerate() {
        if arg.len() > limits.max_arg_len {
            return Err(GatewayError::PayloadTooLarge(format!(
                "argument {} is {} bytes, at most {} allowed",
                i,
                arg.len(),
                limits.max_arg_len
            )));
        }
        if arg.contains('\0') {
            return Err(GatewayError::InvalidArguments(format!("argument {} contains a NUL byte", i)));
        }
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: ArgLimits = ArgLimits {
        max_args: 3,
        max_arg_len: 8,
    };

    #[test]
    fn empty_and_null_bodies_mean_no_arguments() {
        assert!(parse_arguments(b"", &LIMITS).unwrap().is_empty());
        assert!(parse_arguments(b" \r\n", &LIMITS).unwrap().is_empty());
        assert!(parse_arguments(b"null", &LIMITS).unwrap().is_empty());
        assert!(parse_arguments(b"[]", &LIMITS).unwrap().is_empty());
    }

    #[test]
    fn keeps_order_and_content_verbatim() {
        let args = parse_arguments(br#"["--in", "a b", "$(rm)"]"#, &LIMITS).unwrap();
        assert_eq!(args, vec!["--in", "a b", "$(rm)"]);
    }

    #[test]
    fn rejects_non_string_shapes() {
        let bodies: [&[u8]; 5] = [br#"[["nested"]]"#, br#"[1, 2]"#, br#"{"a": "b"}"#, br#""solo""#, b"[\"open"];
        for body in bodies {
            assert!(
                matches!(parse_arguments(body, &LIMITS), Err(GatewayError::InvalidArguments(_))),
                "{:?} should be rejected",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn enforces_count_and_length_caps() {
        assert!(matches!(
            parse_arguments(br#"["a", "b", "c", "d"]"#, &LIMITS),
            Err(GatewayError::PayloadTooLarge(_))
        ));
        assert!(matches!(
            parse_arguments(br#"["123456789"]"#, &LIMITS),
            Err(GatewayError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn rejects_nul_inside_an_argument() {
        assert!(matches!(
            parse_arguments(br#"["a\u0000b"]"#, &LIMITS),
            Err(GatewayError::InvalidArguments(_))
        ));
    }
}
