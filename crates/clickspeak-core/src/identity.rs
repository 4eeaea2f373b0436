//! Who the application is, as far as the OS is concerned.

/// Command operators run to (re)create the runtime.
pub const PROVISION_COMMAND: &str = "clickspeak-tools provision";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageDescription {
    /// Info.plist key, e.g. `NSMicrophoneUsageDescription`.
    pub key: &'static str,
    pub text: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: &'static str,
    pub display_name: &'static str,
    pub bundle_identifier: &'static str,
    pub version: &'static str,
    /// Python package providing the entry point.
    pub package: &'static str,
    pub entry_module: &'static str,
    pub entry_function: &'static str,
    pub category: &'static str,
    /// Menu-bar only: no Dock icon (`LSUIElement`).
    pub background_only: bool,
    pub usage_descriptions: &'static [UsageDescription],
}

pub const CLICKSPEAK: AppIdentity = AppIdentity {
    name: "ClickSpeak",
    display_name: "ClickSpeak",
    bundle_identifier: "com.lamosty.clickspeak",
    version: "0.1.0",
    package: "clickspeak",
    entry_module: "clickspeak.__main__",
    entry_function: "main",
    category: "public.app-category.productivity",
    background_only: true,
    usage_descriptions: &[
        UsageDescription {
            key: "NSMicrophoneUsageDescription",
            text: "ClickSpeak needs microphone access for voice-to-text transcription.",
        },
        UsageDescription {
            key: "NSAppleEventsUsageDescription",
            text: "ClickSpeak needs accessibility access to paste transcribed text into other apps.",
        },
        UsageDescription {
            key: "NSInputMonitoringUsageDescription",
            text: "ClickSpeak needs input monitoring permission to use the global hotkey (Option+Space).",
        },
    ],
};

impl AppIdentity {
    pub fn bundle_dir_name(&self) -> String {
        format!("{}.app", self.name)
    }
}

impl Default for AppIdentity {
    fn default() -> Self {
        CLICKSPEAK
    }
}
