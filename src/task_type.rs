/// Anything that names a kind of task. Handlers are registered per type name
/// and workers only claim tasks whose type name they have a handler for.
pub trait TaskType: ToString + std::fmt::Debug + Send + Sync {}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskTypeName(pub String);

impl From<String> for TaskTypeName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for TaskTypeName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for TaskTypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TaskType for TaskTypeName {}
impl TaskType for &str {}
impl TaskType for String {}
