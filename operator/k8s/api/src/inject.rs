//! Idempotent pod-spec edits. Every item is matched by name: an existing item
//! with the same name is replaced in place, otherwise the item is appended.

use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, Volume, VolumeMount};

pub fn container(spec: &mut PodSpec, container: &Container) {
    upsert(&mut spec.containers, container, |c| &c.name);
}

pub fn volume(spec: &mut PodSpec, volume: &Volume) {
    upsert(spec.volumes.get_or_insert_with(Vec::new), volume, |v| &v.name);
}

/// Mounts the volume in every container, including init containers.
pub fn volume_mount(spec: &mut PodSpec, mount: &VolumeMount) {
    for c in all_containers(spec) {
        upsert(c.volume_mounts.get_or_insert_with(Vec::new), mount, |m| {
            &m.name
        });
    }
}

/// Sets the variable in every container, including init containers.
pub fn env(spec: &mut PodSpec, var: &EnvVar) {
    for c in all_containers(spec) {
        upsert(c.env.get_or_insert_with(Vec::new), var, |e| &e.name);
    }
}

fn all_containers(spec: &mut PodSpec) -> impl Iterator<Item = &mut Container> {
    spec.containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut().flatten())
}

fn upsert<T: Clone>(items: &mut Vec<T>, item: &T, name: impl Fn(&T) -> &String) {
    match items.iter_mut().find(|i| name(i) == name(item)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}
