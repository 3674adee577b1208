//! Content-Type gating for cache admission.

/// Returns whether a response with this `Content-Type` may be cached.
///
/// The value is parsed as `type/subtype[+suffix]`; parameters after `;`
/// are discarded and matching is case-insensitive. Both the subtype and a
/// structured-syntax suffix (e.g. `svg+xml`) are checked against the
/// allow table, so `application/vnd.api+json` is cacheable through its
/// `json` suffix. Unparseable values are not cacheable.
pub fn is_cacheable(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();

    let Some((ty, subtype)) = essence.split_once('/') else {
        return false;
    };
    let ty = ty.trim().to_ascii_lowercase();
    let subtype = subtype.trim().to_ascii_lowercase();
    if ty.is_empty() || subtype.is_empty() {
        return false;
    }

    if allowed(&ty, &subtype) {
        return true;
    }
    match subtype.rsplit_once('+') {
        Some((_, suffix)) => allowed(&ty, suffix),
        None => false,
    }
}

fn allowed(ty: &str, subtype: &str) -> bool {
    matches!(
        (ty, subtype),
        ("application", "xml" | "json" | "javascript")
            | ("text", "javascript" | "xml" | "css" | "html" | "plain")
    )
}
