use super::targets_kind;

/// References a workload in the policy's own namespace.
#[derive(
    Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct LocalTargetRef {
    pub group: Option<String>,
    pub kind: String,
    pub name: String,
}

impl LocalTargetRef {
    pub fn from_resource<T>(resource: &T) -> Self
    where
        T: kube::Resource,
        T::DynamicType: Default,
    {
        let dt = Default::default();

        let group = match T::group(&dt) {
            g if (*g).is_empty() => None,
            g => Some(g.to_string()),
        };

        let name = resource
            .meta()
            .name
            .clone()
            .expect("resource must have a name");

        Self {
            group,
            kind: T::kind(&dt).to_string(),
            name,
        }
    }

    /// Returns the target ref kind, qualified by its group, if necessary.
    pub fn canonical_kind(&self) -> String {
        if let Some(group) = self.group.as_deref().filter(|g| !g.is_empty()) {
            format!("{}.{}", self.kind, group)
        } else {
            self.kind.clone()
        }
    }

    /// Checks whether the target references the given resource type.
    pub fn targets_kind<T>(&self) -> bool
    where
        T: kube::Resource,
        T::DynamicType: Default,
    {
        targets_kind::<T>(self.group.as_deref(), &self.kind)
    }

    /// Checks whether the target references the given resource, assuming the
    /// resource lives in the policy's namespace.
    pub fn targets<T>(&self, resource: &T) -> bool
    where
        T: kube::Resource,
        T::DynamicType: Default,
    {
        if !self.targets_kind::<T>() {
            return false;
        }

        match resource.meta().name.as_deref() {
            Some(rname) => rname.eq_ignore_ascii_case(&self.name),
            None => false,
        }
    }
}
