fn main() {
    // Embed Windows version info into the CLI binary
    #[cfg(windows)]
    {
        let mut res = winres::WindowsResource::new();
        res.set("ProductName", "Process Monitor");
        res.set("FileDescription", "Process start/stop event monitor");
        res.set("CompanyName", "Process Monitor Contributors");
        res.set("OriginalFilename", "process-monitor.exe");
        res.set("FileVersion", env!("CARGO_PKG_VERSION"));
        res.set("ProductVersion", env!("CARGO_PKG_VERSION"));
        res.compile().unwrap();
    }
}
