#[cfg(test)]
pub(crate) mod tests {
    use candle_core::Device;

    /// Devices to run layer tests on.
    ///
    /// The CPU is always included, CUDA and Metal devices are added when
    /// the corresponding backend is compiled in and a device is present.
    pub fn test_devices() -> Vec<Device> {
        [Device::new_cuda(0), Device::new_metal(0)]
            .into_iter()
            .filter_map(Result::ok)
            .fold(vec![Device::Cpu], |mut devices, device| {
                devices.push(device);
                devices
            })
    }
}
