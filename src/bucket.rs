//! Slot accounting and bucket planning
//!
//! Origins are partitioned into buckets, each converging onto one merged
//! ingress. Placement is sticky: an origin already listed among a merged
//! ingress's owner references stays in that bucket even when the packing is
//! no longer optimal, because the merged ingress's load-balancer address is
//! already published through DNS and must not move.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::Ingress;

/// One destination-sized partition of origin ingresses
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    /// Existing merged ingress this bucket converges onto, if any
    pub destination: Option<Ingress>,
    /// Remaining slot budget; negative when pre-claimed origins exceed it
    pub free_slots: i64,
    /// Contributing origins in placement order
    pub ingresses: Vec<Ingress>,
}

/// Number of load-balancer slots an origin occupies.
///
/// Edge load balancers bill per service binding, not per hostname, so every
/// rule counts its paths and a rules-only host still occupies one binding.
/// An origin with no rules at all still counts as one slot, otherwise any
/// number of empty origins would pile into a single bucket.
pub fn ingress_slots(ingress: &Ingress) -> i64 {
    let rule_slots: i64 = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .map(|rules| {
            rules
                .iter()
                .map(|rule| {
                    rule.http
                        .as_ref()
                        .map_or(0, |http| http.paths.len())
                        .max(1) as i64
                })
                .sum()
        })
        .unwrap_or(0);

    rule_slots.max(1)
}

/// Partition `origins` into buckets of at most `max_slots` slots.
///
/// Buckets are seeded from the existing merged ingresses, ordered by name.
/// Origins claimed by a merged ingress's owner references are attached to its
/// bucket unconditionally; the remaining origins are packed smallest-first
/// (newer ones ahead on ties) into residual seeded capacity and then into
/// fresh overflow buckets. Seeded buckets that end up with no origins are not
/// returned; their merged ingress is left for garbage collection.
pub fn generate_buckets(
    origins: Vec<Ingress>,
    destinations: &[Ingress],
    max_slots: i64,
) -> Vec<Bucket> {
    let mut destinations: Vec<Ingress> = destinations.to_vec();
    destinations.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    // (owner name, owner uid) -> seeded bucket index
    let mut claims: BTreeMap<(String, String), usize> = BTreeMap::new();
    for (index, destination) in destinations.iter().enumerate() {
        for owner in destination.metadata.owner_references.iter().flatten() {
            if owner.kind == "Ingress" {
                claims.insert((owner.name.clone(), owner.uid.clone()), index);
            }
        }
    }

    let mut buckets: Vec<Bucket> = destinations
        .into_iter()
        .map(|destination| Bucket {
            destination: Some(destination),
            free_slots: max_slots,
            ingresses: Vec::new(),
        })
        .collect();
    let seeded_len = buckets.len();

    // Attach pre-claimed origins first. These never move, so free_slots may
    // go negative here.
    let mut unclaimed: Vec<Ingress> = Vec::new();
    for origin in origins {
        let key = (
            origin.metadata.name.clone().unwrap_or_default(),
            origin.metadata.uid.clone().unwrap_or_default(),
        );
        match claims.get(&key) {
            Some(&index) => {
                buckets[index].free_slots -= ingress_slots(&origin);
                buckets[index].ingresses.push(origin);
            }
            None => unclaimed.push(origin),
        }
    }

    // Smaller origins first so they fit residual space; newer ones ahead on
    // ties so fresh additions pack eagerly while older origins keep their
    // current destination across reconciles.
    unclaimed.sort_by(|a, b| {
        ingress_slots(a)
            .cmp(&ingress_slots(b))
            .then_with(|| b.metadata.creation_timestamp.cmp(&a.metadata.creation_timestamp))
    });

    let mut current: Option<usize> = None;
    let mut next_seeded = 0usize;

    for origin in unclaimed {
        let slots = ingress_slots(&origin);
        let fits = current.is_some_and(|index| buckets[index].free_slots - slots >= 0);
        if !fits {
            current = Some(next_bucket(&mut buckets, &mut next_seeded, seeded_len, max_slots));
        }
        if let Some(index) = current {
            buckets[index].free_slots -= slots;
            buckets[index].ingresses.push(origin);
        }
    }

    buckets.retain(|bucket| !bucket.ingresses.is_empty());
    buckets
}

/// Advance to the next seeded bucket with residual capacity, or allocate a
/// fresh overflow bucket once the seeded ones are exhausted.
fn next_bucket(
    buckets: &mut Vec<Bucket>,
    next_seeded: &mut usize,
    seeded_len: usize,
    max_slots: i64,
) -> usize {
    while *next_seeded < seeded_len {
        let index = *next_seeded;
        *next_seeded += 1;
        if buckets[index].free_slots > 0 {
            return index;
        }
    }

    buckets.push(Bucket {
        destination: None,
        free_slots: max_slots,
        ingresses: Vec::new(),
    });
    buckets.len() - 1
}
