use zerocopy::AsBytes;

/// Directory.
pub const T_DIR: i16 = 1;
/// File.
pub const T_FILE: i16 = 2;
/// Device.
pub const T_DEVICE: i16 = 3;

/// Metadata as returned by fstat(2); copied out to user space verbatim.
// repr(C): shared with user programs.
#[derive(Copy, Clone, AsBytes)]
#[repr(C)]
pub struct Stat {
    /// Device the file lives on.
    pub dev: i32,
    /// Inode number.
    pub ino: u32,
    /// Type of file.
    pub typ: i16,
    /// Number of links to file.
    pub nlink: i16,
    /// Explicit padding so the struct has no hidden bytes.
    pub _pad: i32,
    /// Size of file in bytes.
    pub size: u64,
}
