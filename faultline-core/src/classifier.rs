//! Maps exceptions to HTTP status codes.

use crate::StatusCode;
use crate::config::StatusCodeTable;
use crate::exception::ExceptionInfo;

/// Returns the status code an exception should be answered with.
///
/// An explicit code carried by the exception wins. Otherwise the exception's
/// concrete type name is looked up in `table`, and the table's default is
/// used when there is no entry. Ancestors are not consulted.
///
/// # Examples
///
/// ```
/// use faultline_core::StatusCode;
/// use faultline_core::classifier::status_code_for;
/// use faultline_core::config::StatusCodeTable;
/// use faultline_core::exception::{ExceptionInfo, TypeHierarchy};
///
/// let hierarchy = TypeHierarchy::with_defaults();
/// let table = StatusCodeTable::default();
///
/// let exception = ExceptionInfo::new(hierarchy.lookup("RoutingError"), "no route");
/// assert_eq!(status_code_for(&exception, &table), StatusCode::NOT_FOUND);
///
/// let exception = ExceptionInfo::new(hierarchy.lookup("StandardError"), "oops");
/// assert_eq!(status_code_for(&exception, &table), StatusCode::INTERNAL_SERVER_ERROR);
/// ```
#[must_use]
pub fn status_code_for(exception: &ExceptionInfo, table: &StatusCodeTable) -> StatusCode {
    exception
        .status_code()
        .or_else(|| table.get(exception.type_name()))
        .unwrap_or(table.default)
}
