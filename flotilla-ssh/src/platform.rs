//! Remote platform detection from `uname -m`

use flotilla_core::Platform;

pub const UNAME_COMMAND: &str = "uname -m";

const OS_LINUX: &str = "linux";

/// Map a kernel machine name onto an OCI platform. Unknown machines yield `None`.
pub fn parse_machine(machine: &str) -> Option<Platform> {
    let (architecture, variant) = match machine.trim() {
        "x86_64" | "amd64" => ("amd64", ""),
        "aarch64" | "arm64" => ("arm64", ""),
        "armv7l" | "armv7" => ("arm", "v7"),
        "armv6l" | "armv6" => ("arm", "v6"),
        "i386" | "i686" => ("386", ""),
        "ppc64le" => ("ppc64le", ""),
        "s390x" => ("s390x", ""),
        "riscv64" => ("riscv64", ""),
        "loongarch64" => ("loong64", ""),
        _ => return None,
    };
    Some(Platform::new(OS_LINUX, architecture, variant))
}
