use clap::Args;

use aprov::probe::{detect_capabilities, max_users};

use crate::utils::{connect, single_device};

#[derive(Args)]
pub struct Probe {
    /// Device serial; defaults to the single connected device
    #[arg(short, long)]
    device: Option<String>,

    /// Emit the capability snapshot as JSON
    #[arg(long)]
    json: bool,
}

impl Probe {
    pub fn run(&self) -> anyhow::Result<()> {
        let adb = connect()?;
        let device = single_device(&*adb, self.device.as_deref())?;

        let caps = detect_capabilities(&*adb, &device);
        if self.json {
            println!("{}", serde_json::to_string_pretty(&caps)?);
            return Ok(());
        }

        let yn = |b: bool| if b { "yes" } else { "no" };
        println!("device:            {}", caps.device_id);
        println!("sdk version:       {}", caps.sdk_version);
        println!("root access:       {}", yn(caps.root_access));
        println!("resetprop:         {}", yn(caps.resetprop_available));
        println!("multi-user:        {}", yn(caps.multi_user_support));
        println!("ephemeral users:   {}", yn(caps.ephemeral_user_support));
        println!("user ceiling:      {}", max_users(&*adb, &device));
        Ok(())
    }
}
