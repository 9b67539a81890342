//! TypedTask trait - 型付き Task の定義
//!
//! 構造体を task の引数として使い、`NAME` を registry key にします。
//! submit 側と worker 側が同じ型を共有すれば func_name の typo は起きません。

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::TaskArgs;

/// A task whose arguments are a single serializable struct.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resize { path: String, width: u32 }
///
/// impl TypedTask for Resize {
///     const NAME: &'static str = "images.resize.v1";
///     type Output = String;
/// }
/// ```
pub trait TypedTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registry key. Convention: `{namespace}.{action}.v{major}`.
    const NAME: &'static str;

    type Output: Serialize + Send + 'static;

    /// Encode as handler arguments: a struct goes to the named arguments,
    /// anything else becomes the single positional argument.
    fn to_args(&self) -> Result<TaskArgs, serde_json::Error> {
        Ok(match serde_json::to_value(self)? {
            Value::Object(kwargs) => TaskArgs {
                args: Vec::new(),
                kwargs,
            },
            other => TaskArgs::new().arg(other),
        })
    }

    /// Inverse of [`TypedTask::to_args`].
    fn from_args(args: &TaskArgs) -> Result<Self, serde_json::Error> {
        match args.args.as_slice() {
            [single] if args.kwargs.is_empty() => serde_json::from_value(single.clone()),
            _ => args.decode_kwargs(),
        }
    }
}
