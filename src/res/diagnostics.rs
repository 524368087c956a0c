//! Lifecycle events of operations, for profilers and debug views.

use super::handle::OperationHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticEventType {
    AsyncOperationCreate,
    /// Posted every `update` for pending operations, `value` is in percent.
    AsyncOperationPercentComplete,
    AsyncOperationComplete,
    AsyncOperationFail,
    /// `value` is the new reference count.
    AsyncOperationReferenceCount,
    AsyncOperationDestroy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticEvent {
    pub handle: OperationHandle,
    pub kind: DiagnosticEventType,
    pub value: i32,
    /// The debug name of the operation.
    pub context: String,
}

pub(crate) type DiagnosticCallback = Box<dyn FnMut(&DiagnosticEvent)>;
