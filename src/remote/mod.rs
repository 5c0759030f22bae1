// 远程文件系统操作
pub mod exec;
pub mod listing;
pub mod path;

pub use listing::RemoteEntry;
