//! Owner references are weak `{apiVersion, kind, name, uid}` records; the
//! helpers here only inspect and edit them, cascading deletion is left to the
//! cluster.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::ObjectMeta, Resource};

/// Returns the object's controller reference, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Returns true if the reference points at a resource of type `K`.
pub fn is_kind<K>(oref: &OwnerReference) -> bool
where
    K: Resource<DynamicType = ()>,
{
    oref.kind == K::kind(&()) && oref.api_version == K::api_version(&())
}

/// Returns true if `owner` is the controller of `meta`.
pub fn is_controlled_by<K>(meta: &ObjectMeta, owner: &K) -> bool
where
    K: Resource<DynamicType = ()>,
{
    let uid = owner.meta().uid.as_deref();
    controller_of(meta).is_some_and(|r| is_kind::<K>(r) && uid == Some(r.uid.as_str()))
}

/// Returns true if any reference, controlling or not, points at `owner`.
pub fn is_owned_by<K>(meta: &ObjectMeta, owner_name: &str) -> bool
where
    K: Resource<DynamicType = ()>,
{
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| is_kind::<K>(r) && r.name == owner_name)
}

/// Builds a plain, non-controlling reference to `owner`.
pub fn reference_to<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let mut oref = owner.controller_owner_ref(&())?;
    oref.controller = None;
    oref.block_owner_deletion = None;
    Some(oref)
}

/// Makes `owner` the controller of `meta`, replacing any other controller
/// reference. Returns false if `owner` already controls it.
///
/// Fails (returning `None`) if the owner has not been persisted yet and so
/// has no uid.
pub fn set_controller<K>(meta: &mut ObjectMeta, owner: &K) -> Option<bool>
where
    K: Resource<DynamicType = ()>,
{
    if is_controlled_by(meta, owner) {
        return Some(false);
    }
    let oref = owner.controller_owner_ref(&())?;
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.controller != Some(true) && r.uid != oref.uid);
    refs.push(oref);
    Some(true)
}
