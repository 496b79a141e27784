use clap::Args;

use aprov::adb::Adb;

use crate::utils::connect;

#[derive(Args)]
pub struct Devices {}

impl Devices {
    pub fn run(&self) -> anyhow::Result<()> {
        let adb = connect()?;
        let serials = adb.devices()?;
        for serial in serials {
            let brand = adb.getprop(&serial, "ro.product.brand");
            let model = adb.getprop(&serial, "ro.product.model");
            let release = adb.getprop(&serial, "ro.build.version.release");
            println!("{serial}\t{brand} {model} (Android {release})");
        }
        Ok(())
    }
}
