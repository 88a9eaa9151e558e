/// Checks the inbound webhook's `token` query parameter against the
/// configured shared secret. An unconfigured secret rejects everything.
pub(super) fn verify_inbound_token(
    expected: Option<&str>,
    provided: Option<&str>,
) -> Result<(), &'static str> {
    let Some(expected) = expected.filter(|value| !value.trim().is_empty()) else {
        return Err("token_not_configured");
    };
    let provided = provided
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or("missing_token")?;
    if provided != expected {
        return Err("invalid_token");
    }
    Ok(())
}
