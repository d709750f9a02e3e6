//! Canonical Merkle computation over a set of filesystem diffs.
//!
//! Every byte in this module is dictated by the wire contract: version
//! and tag bytes, `len32_be || bytes` field framing, exact field order
//! per variant, the xattrs-hash algorithm, and the Merkle fold. None
//! of it is incidental — changing a byte here breaks cross-language
//! reproducibility.

use crate::diff::{ContentHasher, Diff, ModifiedKind, NodeKind};
use crate::digest::{Digest, StreamingHasher};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Canonical `"sha256:<64-hex>"` identifier for a diff set, domain
/// separated by base lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffKey(Digest);

impl DiffKey {
    /// Parse a canonical DiffKey string.
    pub fn parse(s: &str) -> Result<Self> {
        Digest::parse(s)
            .map(DiffKey)
            .map_err(|_| Error::InvalidFormat(format!("invalid DiffKey: {s}")))
    }
}

impl std::fmt::Display for DiffKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filesystem context needed to resolve content hashes and deleted-entry
/// stat lookups while computing a DiffKey. Both mounts are optional —
/// an absent mount degrades the corresponding field to its missing form
/// rather than failing the computation (per spec §9's open question on
/// deleted-entry `nodeType` resolution).
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffKeyContext<'a> {
    /// Root of the snapshot the diffs were computed against (child side).
    pub target_mount: Option<&'a Path>,
    /// Root of the snapshot's parent (base side), used to resolve
    /// deleted-entry node types and directory emptiness.
    pub base_mount: Option<&'a Path>,
}

/// Compute the canonical DiffKey for a set of diff records.
///
/// `base_digest` and `couple_to_base` implement the domain-separation
/// rule of §4.3.7: when `couple_to_base` is `false` the key is
/// independent of lineage (`"anybase"`); otherwise it is tied to
/// `base_digest` (or `"scratch"` when there is no parent).
pub fn compute(
    diffs: &[Diff],
    ctx: DiffKeyContext<'_>,
    base_digest: Option<Digest>,
    couple_to_base: bool,
) -> Result<DiffKey> {
    let mut records: Vec<Vec<u8>> = Vec::with_capacity(diffs.len());
    for diff in diffs {
        if let Some(record) = encode_record(diff, ctx)? {
            records.push(record);
        }
    }
    records.sort();

    let root = fold(&records);
    let base_tag = match (couple_to_base, base_digest) {
        (false, _) => "anybase".to_string(),
        (true, Some(digest)) => digest.to_string_value(),
        (true, None) => "scratch".to_string(),
    };
    let prefix = format!("diffkey:v1|{base_tag}|");

    let mut hasher = StreamingHasher::new();
    hasher.update(prefix.as_bytes());
    hasher.update(root.as_bytes());
    Ok(DiffKey(hasher.finalize()))
}

fn field(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

fn decimal_or_dash(v: Option<u32>) -> Vec<u8> {
    match v {
        Some(n) => n.to_string().into_bytes(),
        None => b"-".to_vec(),
    }
}

fn path_or_dash(v: Option<&crate::binary_path::BinaryPath>) -> Vec<u8> {
    match v {
        Some(p) => p.as_bytes().to_vec(),
        None => b"-".to_vec(),
    }
}

fn xattrs_hash(xattrs: Option<&std::collections::BTreeMap<Vec<u8>, Vec<u8>>>) -> Digest {
    let mut hasher = StreamingHasher::new();
    if let Some(map) = xattrs {
        // BTreeMap<Vec<u8>, _> already iterates in unsigned-byte lex
        // key order, which is exactly what §4.3.5 requires.
        for (key, value) in map.iter() {
            hasher.update(&(key.len() as u32).to_be_bytes());
            hasher.update(key);
            hasher.update(&(value.len() as u32).to_be_bytes());
            hasher.update(value);
        }
    }
    hasher.finalize()
}

fn join_mount(mount: &Path, path: &crate::binary_path::BinaryPath) -> PathBuf {
    let rel = path.as_bytes().strip_prefix(b"/").unwrap_or(path.as_bytes());
    mount.join(String::from_utf8_lossy(rel).as_ref())
}

fn resolve_content_hash(
    path: &crate::binary_path::BinaryPath,
    node: NodeKind,
    emit: bool,
    target_mount: Option<&Path>,
) -> Result<Option<Digest>> {
    if !emit || node != NodeKind::Regular {
        return Ok(None);
    }
    let Some(mount) = target_mount else {
        return Ok(None);
    };
    let full = join_mount(mount, path);
    if full.is_file() {
        Ok(Some(ContentHasher::hash_file(&full)?))
    } else {
        Ok(None)
    }
}

fn stat_node_kind(path: &Path) -> Option<NodeKind> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    let ft = meta.file_type();
    if ft.is_symlink() {
        Some(NodeKind::Symlink)
    } else if ft.is_dir() {
        Some(NodeKind::Directory)
    } else if ft.is_file() {
        Some(NodeKind::Regular)
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ft.is_char_device() || ft.is_block_device() {
                return Some(NodeKind::Device);
            }
            if ft.is_fifo() {
                return Some(NodeKind::Fifo);
            }
            if ft.is_socket() {
                return Some(NodeKind::Socket);
            }
        }
        None
    }
}

/// Resolve the base-side node type and directory-emptiness of a
/// deleted path. Returns `(node_kind, non_empty)`; `node_kind` is
/// `None` when the base side is unreachable, per §9's open question.
fn resolve_deleted(
    path: &crate::binary_path::BinaryPath,
    base_mount: Option<&Path>,
) -> (Option<NodeKind>, bool) {
    let Some(mount) = base_mount else {
        return (None, false);
    };
    let full = join_mount(mount, path);
    let kind = stat_node_kind(&full);
    let non_empty = if matches!(kind, Some(NodeKind::Directory)) {
        std::fs::read_dir(&full)
            .map(|mut it| it.next().is_some())
            .unwrap_or(false)
    } else {
        false
    };
    (kind, non_empty)
}

/// Encode one diff record, returning `None` when the exclusion policy
/// of §4.3.2 drops it (sockets/devices).
fn encode_record(diff: &Diff, ctx: DiffKeyContext<'_>) -> Result<Option<Vec<u8>>> {
    let mut out = vec![0x01u8];

    match diff {
        Diff::Added { path, node, attrs } => {
            if matches!(node, NodeKind::Socket | NodeKind::Device) {
                return Ok(None);
            }
            out.push(0x41);
            out.extend(field(path.as_bytes()));
            out.extend(field(node.canonical_str().as_bytes()));
            out.extend(field(&decimal_or_dash(attrs.permissions)));
            out.extend(field(&decimal_or_dash(attrs.uid)));
            out.extend(field(&decimal_or_dash(attrs.gid)));
            out.extend(field(&path_or_dash(attrs.link_target.as_ref())));
            let xattrs_field = format!("xh:{}", xattrs_hash(attrs.xattrs.as_ref()).to_hex());
            out.extend(field(xattrs_field.as_bytes()));
            let content = resolve_content_hash(path, *node, true, ctx.target_mount)?;
            let content_field = format!(
                "ch:{}",
                content.map(|d| d.to_hex()).unwrap_or_else(|| "-".to_string())
            );
            out.extend(field(content_field.as_bytes()));
        }
        Diff::Modified {
            path,
            kind,
            node,
            attrs,
        } => {
            if matches!(node, NodeKind::Socket | NodeKind::Device) {
                return Ok(None);
            }
            out.push(0x4D);
            out.extend(field(path.as_bytes()));
            out.extend(field(kind.canonical_str().as_bytes()));
            out.extend(field(node.canonical_str().as_bytes()));
            out.extend(field(&decimal_or_dash(attrs.permissions)));
            out.extend(field(&decimal_or_dash(attrs.uid)));
            out.extend(field(&decimal_or_dash(attrs.gid)));
            out.extend(field(&path_or_dash(attrs.link_target.as_ref())));
            let xattrs_field = format!("xh:{}", xattrs_hash(attrs.xattrs.as_ref()).to_hex());
            out.extend(field(xattrs_field.as_bytes()));
            let emit_content = matches!(kind, ModifiedKind::ContentChanged);
            let content = resolve_content_hash(path, *node, emit_content, ctx.target_mount)?;
            let content_field = format!(
                "ch:{}",
                content.map(|d| d.to_hex()).unwrap_or_else(|| "-".to_string())
            );
            out.extend(field(content_field.as_bytes()));
        }
        Diff::Deleted { path } => {
            let (resolved_kind, non_empty) = resolve_deleted(path, ctx.base_mount);
            if matches!(resolved_kind, Some(NodeKind::Socket) | Some(NodeKind::Device)) {
                return Ok(None);
            }
            out.push(0x44);
            out.extend(field(path.as_bytes()));
            let node_field = resolved_kind
                .map(|k| k.canonical_str().to_string())
                .unwrap_or_else(|| "-".to_string());
            out.extend(field(node_field.as_bytes()));
            let opaque_field = if non_empty { "opq:1" } else { "opq:0" };
            out.extend(field(opaque_field.as_bytes()));
        }
    }

    Ok(Some(out))
}

/// `SHA-256(0x4C || record)`.
fn leaf_hash(record: &[u8]) -> Digest {
    let mut hasher = StreamingHasher::new();
    hasher.update(&[0x4C]);
    hasher.update(record);
    hasher.finalize()
}

/// `SHA-256(0x49 || left || right)`.
fn inner_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = StreamingHasher::new();
    hasher.update(&[0x49]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.finalize()
}

fn empty_root() -> Digest {
    let mut hasher = StreamingHasher::new();
    hasher.update(&[0x45]);
    hasher.update(b"empty");
    hasher.finalize()
}

fn fold(sorted_records: &[Vec<u8>]) -> Digest {
    if sorted_records.is_empty() {
        return empty_root();
    }
    let mut level: Vec<Digest> = sorted_records.iter().map(|r| leaf_hash(r)).collect();
    if level.len() == 1 {
        return level[0];
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks(2)
            .map(|pair| inner_hash(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::NodeAttributes;
    use crate::binary_path::BinaryPath;
    use proptest::prelude::*;

    fn added(path: &str, node: NodeKind, perms: Option<u32>) -> Diff {
        Diff::Added {
            path: BinaryPath::from_utf8(path),
            node,
            attrs: NodeAttributes {
                permissions: perms,
                ..Default::default()
            },
        }
    }

    // S1 — empty diff.
    #[test]
    fn s1_empty_diff_matches_known_value() {
        let key = compute(&[], DiffKeyContext::default(), None, true).unwrap();
        let root = empty_root();
        let mut hasher = StreamingHasher::new();
        hasher.update(b"diffkey:v1|scratch|");
        hasher.update(root.as_bytes());
        let expected = DiffKey(hasher.finalize());
        assert_eq!(key, expected);
        assert_eq!(key.to_string(), expected.to_string());
    }

    // S2 — single add, permutation invariance + sensitivity to perms.
    #[test]
    fn s2_single_add_stable_and_sensitive_to_perms() {
        let d = [added("/a", NodeKind::Regular, Some(0o644))];
        let k1 = compute(&d, DiffKeyContext::default(), None, true).unwrap();
        let k2 = compute(&d, DiffKeyContext::default(), None, true).unwrap();
        assert_eq!(k1, k2);

        let d2 = [added("/a", NodeKind::Regular, Some(0o755))];
        let k3 = compute(&d2, DiffKeyContext::default(), None, true).unwrap();
        assert_ne!(k1, k3);
    }

    // S3 — reordering.
    #[test]
    fn s3_reordering_invariance() {
        let forward = [
            added("a", NodeKind::Regular, None),
            added("b", NodeKind::Regular, None),
            added("c", NodeKind::Regular, None),
        ];
        let shuffled = [
            added("c", NodeKind::Regular, None),
            added("a", NodeKind::Regular, None),
            added("b", NodeKind::Regular, None),
        ];
        let k1 = compute(&forward, DiffKeyContext::default(), None, true).unwrap();
        let k2 = compute(&shuffled, DiffKeyContext::default(), None, true).unwrap();
        assert_eq!(k1, k2);
    }

    // Invariant 3 — socket/device exclusion.
    #[test]
    fn exclusion_of_socket_and_device_records() {
        let base = [added("a", NodeKind::Regular, None)];
        let with_socket = [
            added("a", NodeKind::Regular, None),
            added("sock", NodeKind::Socket, None),
        ];
        let with_device = [
            added("a", NodeKind::Regular, None),
            added("dev", NodeKind::Device, None),
        ];
        let k_base = compute(&base, DiffKeyContext::default(), None, true).unwrap();
        let k_socket = compute(&with_socket, DiffKeyContext::default(), None, true).unwrap();
        let k_device = compute(&with_device, DiffKeyContext::default(), None, true).unwrap();
        assert_eq!(k_base, k_socket);
        assert_eq!(k_base, k_device);
    }

    // Invariant 4 — domain separation.
    #[test]
    fn domain_separation_on_base_tag() {
        let d = [added("a", NodeKind::Regular, None)];
        let scratch = compute(&d, DiffKeyContext::default(), None, true).unwrap();
        let anybase = compute(&d, DiffKeyContext::default(), None, false).unwrap();
        let with_base = compute(
            &d,
            DiffKeyContext::default(),
            Some(Digest::of(b"base")),
            true,
        )
        .unwrap();
        assert_ne!(scratch, anybase);
        assert_ne!(scratch, with_base);
        assert_ne!(anybase, with_base);
    }

    // Invariant 5 — parse round-trip.
    #[test]
    fn parse_round_trip_and_rejects_garbage() {
        let d = [added("a", NodeKind::Regular, None)];
        let key = compute(&d, DiffKeyContext::default(), None, true).unwrap();
        let parsed = DiffKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
        assert!(DiffKey::parse("not-a-key").is_err());
        assert!(DiffKey::parse("sha256:deadbeef").is_err());
    }

    #[test]
    fn distinguishable_field_changes_produce_different_keys() {
        let base = added("a", NodeKind::Regular, Some(0o644));
        let k_base = compute(&[base.clone()], DiffKeyContext::default(), None, true).unwrap();

        let different_path = added("b", NodeKind::Regular, Some(0o644));
        assert_ne!(
            k_base,
            compute(&[different_path], DiffKeyContext::default(), None, true).unwrap()
        );

        let different_node = added("a", NodeKind::Directory, Some(0o644));
        assert_ne!(
            k_base,
            compute(&[different_node], DiffKeyContext::default(), None, true).unwrap()
        );
    }

    #[test]
    fn deleted_record_without_base_mount_uses_dash_and_non_opaque() {
        let d = [Diff::Deleted {
            path: BinaryPath::from_utf8("/gone"),
        }];
        // Should not error even though base_mount is absent.
        let key = compute(&d, DiffKeyContext::default(), None, true);
        assert!(key.is_ok());
    }

    proptest! {
        // Invariant 1 — purity: compute(D) = compute(permutation(D)).
        #[test]
        fn prop_purity_under_permutation(names in prop::collection::vec("[a-z]{1,8}", 1..8)) {
            let diffs: Vec<Diff> = names
                .iter()
                .enumerate()
                .map(|(i, n)| added(&format!("{n}{i}"), NodeKind::Regular, None))
                .collect();
            let mut shuffled = diffs.clone();
            shuffled.reverse();

            let forward = compute(&diffs, DiffKeyContext::default(), None, true).unwrap();
            let backward = compute(&shuffled, DiffKeyContext::default(), None, true).unwrap();
            prop_assert_eq!(forward, backward);
        }

        // Invariant 2 — collision resistance: a changed permissions
        // field on an otherwise identical record changes the key.
        #[test]
        fn prop_distinguishable_permissions_differ(path in "[a-z]{1,8}", p1 in 0u32..0o1000, p2 in 0u32..0o1000) {
            prop_assume!(p1 != p2);
            let k1 = compute(&[added(&path, NodeKind::Regular, Some(p1))], DiffKeyContext::default(), None, true).unwrap();
            let k2 = compute(&[added(&path, NodeKind::Regular, Some(p2))], DiffKeyContext::default(), None, true).unwrap();
            prop_assert_ne!(k1, k2);
        }

        // Invariant 3 — exclusion: socket/device records never affect the key.
        #[test]
        fn prop_exclusion_of_socket_and_device(base_path in "[a-z]{1,8}", extra_path in "[a-z]{1,8}", use_socket in any::<bool>()) {
            prop_assume!(base_path != extra_path);
            let base = [added(&base_path, NodeKind::Regular, None)];
            let extra_kind = if use_socket { NodeKind::Socket } else { NodeKind::Device };
            let with_extra = [
                added(&base_path, NodeKind::Regular, None),
                added(&extra_path, extra_kind, None),
            ];
            let k_base = compute(&base, DiffKeyContext::default(), None, true).unwrap();
            let k_extra = compute(&with_extra, DiffKeyContext::default(), None, true).unwrap();
            prop_assert_eq!(k_base, k_extra);
        }

        // Invariant 4 — domain separation: distinct base tags never collide.
        #[test]
        fn prop_domain_separation_over_base_tags(path in "[a-z]{1,8}", seed_a in any::<u8>(), seed_b in any::<u8>()) {
            prop_assume!(seed_a != seed_b);
            let d = [added(&path, NodeKind::Regular, None)];
            let k_a = compute(&d, DiffKeyContext::default(), Some(Digest::of(&[seed_a])), true).unwrap();
            let k_b = compute(&d, DiffKeyContext::default(), Some(Digest::of(&[seed_b])), true).unwrap();
            prop_assert_ne!(k_a, k_b);
        }

        // Invariant 5 — parse round-trip.
        #[test]
        fn prop_parse_round_trip(path in "[a-z]{1,8}") {
            let d = [added(&path, NodeKind::Regular, None)];
            let key = compute(&d, DiffKeyContext::default(), None, true).unwrap();
            let parsed = DiffKey::parse(&key.to_string()).unwrap();
            prop_assert_eq!(parsed, key);
        }
    }
}
