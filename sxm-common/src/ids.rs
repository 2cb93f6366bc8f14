//! Bidirectional encoding between `(SR, VDI)` pairs and the textual
//! operation ids used as keys into the three registry tables (spec §3.1).

/// `"{sr}/{vdi}"` — the id of the (at most one) active outbound mirror for
/// a source VDI.
pub fn mirror_id_of(sr: &str, vdi: &str) -> String {
    format!("{sr}/{vdi}")
}

/// Splits a mirror id back into `(sr, vdi)`. The VDI half may itself
/// contain `/`, so only the first segment is treated as the SR.
pub fn of_mirror_id(id: &str) -> Option<(String, String)> {
    let (sr, vdi) = id.split_once('/')?;
    if sr.is_empty() || vdi.is_empty() {
        return None;
    }
    Some((sr.to_string(), vdi.to_string()))
}

/// `"copy/{dest_sr}/{dest_vdi_or_source_vdi}"` — a distinct namespace from
/// mirror ids, keyed on whichever VDI `copy_into_vdi`/`copy_into_sr` were
/// invoked against.
pub fn copy_id_of(sr: &str, vdi: &str) -> String {
    format!("copy/{sr}/{vdi}")
}

/// Splits a copy id back into `(sr, vdi)`, stripping the leading `copy`
/// token before applying the same first-segment-is-sr rule as mirror ids.
pub fn of_copy_id(id: &str) -> Option<(String, String)> {
    let rest = id.strip_prefix("copy/")?;
    let (sr, vdi) = rest.split_once('/')?;
    if sr.is_empty() || vdi.is_empty() {
        return None;
    }
    Some((sr.to_string(), vdi.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mirror_id_basic() {
        assert_eq!(mirror_id_of("s1", "v1"), "s1/v1");
        assert_eq!(
            of_mirror_id("s1/v1"),
            Some(("s1".to_string(), "v1".to_string()))
        );
    }

    #[test]
    fn mirror_id_tail_may_contain_slash() {
        assert_eq!(
            of_mirror_id("s1/dir/v1"),
            Some(("s1".to_string(), "dir/v1".to_string()))
        );
    }

    #[test]
    fn copy_id_basic() {
        assert_eq!(copy_id_of("s2", "v1"), "copy/s2/v1");
        assert_eq!(
            of_copy_id("copy/s2/v1"),
            Some(("s2".to_string(), "v1".to_string()))
        );
    }

    #[test]
    fn copy_id_rejects_missing_prefix() {
        assert_eq!(of_copy_id("s2/v1"), None);
    }

    fn id_component() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{1,16}".prop_map(|s| s)
    }

    proptest! {
        #[test]
        fn mirror_id_round_trips(sr in id_component(), vdi in id_component()) {
            let id = mirror_id_of(&sr, &vdi);
            prop_assert_eq!(of_mirror_id(&id), Some((sr, vdi)));
        }

        #[test]
        fn copy_id_round_trips(sr in id_component(), vdi in id_component()) {
            let id = copy_id_of(&sr, &vdi);
            prop_assert_eq!(of_copy_id(&id), Some((sr, vdi)));
        }
    }
}
