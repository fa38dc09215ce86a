//! Static CPU configuration: the emulated model, its optional features and the
//! knobs that change how the interpreter charges time.

use bitflags::bitflags;

use crate::timing::CyclePolicyTable;

/// Emulated processor model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuModel {
    I386,
    I486,
    Pentium,
    PentiumMmx,
    PentiumIII,
    /// Cyrix 6x86MX / MII.
    CyrixMII,
}

impl CpuModel {
    /// 486-class timing applies to everything newer than the 386.
    pub fn is_486_class(self) -> bool {
        !matches!(self, CpuModel::I386)
    }

    pub fn has_cr4(self) -> bool {
        !matches!(self, CpuModel::I386 | CpuModel::I486)
    }

    pub fn has_mmx(self) -> bool {
        matches!(
            self,
            CpuModel::PentiumMmx | CpuModel::PentiumIII | CpuModel::CyrixMII
        )
    }

    pub fn has_sse(self) -> bool {
        matches!(self, CpuModel::PentiumIII)
    }

    pub fn is_cyrix(self) -> bool {
        matches!(self, CpuModel::CyrixMII)
    }

    /// TR6/TR7 (and TR3-TR5 on the 486) only exist before the Pentium.
    pub fn has_test_registers(self) -> bool {
        matches!(self, CpuModel::I386 | CpuModel::I486)
    }

    pub fn has_cpuid(self) -> bool {
        self.has_cr4()
    }

    pub fn has_invlpg(self) -> bool {
        self.is_486_class()
    }

    /// Family/model/stepping as reported in EDX after reset and by CPUID leaf 1.
    pub fn cpuid_signature(self) -> u32 {
        match self {
            CpuModel::I386 => 0x0308,
            CpuModel::I486 => 0x0402,
            CpuModel::Pentium => 0x0525,
            CpuModel::PentiumMmx => 0x0543,
            CpuModel::PentiumIII => 0x0672,
            CpuModel::CyrixMII => 0x0601,
        }
    }

    /// Writable CR4 bits on this model. VME and PVI are not implemented.
    pub fn default_cr4_mask(self) -> u32 {
        match self {
            CpuModel::I386 | CpuModel::I486 => 0,
            CpuModel::Pentium => 0x005c,
            CpuModel::PentiumMmx => 0x015c,
            CpuModel::PentiumIII => 0x07dc,
            CpuModel::CyrixMII => 0x019c,
        }
    }

    pub fn default_features(self) -> Features {
        let mut features = Features::FPU;
        if self.has_cpuid() {
            features |= Features::CPUID;
        }
        if self.has_mmx() {
            features |= Features::MMX;
        }
        if self.has_sse() {
            features |= Features::SSE;
        }
        if self.is_cyrix() {
            features |= Features::CYRIX_SMM;
        }
        features
    }
}

bitflags! {
    /// Optional instruction-set features. Defaults come from [`CpuModel`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        const FPU = 1 << 0;
        const CPUID = 1 << 1;
        const MMX = 1 << 2;
        const SSE = 1 << 3;
        const CYRIX_SMM = 1 << 4;
    }
}

/// Which x87 arithmetic back-end executes floating-point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FpuBackendKind {
    /// Exact 80-bit extended precision, rounded per FCW.RC.
    #[default]
    SoftFloat,
    /// Host `f64` arithmetic.
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("SSE requires MMX")]
    SseWithoutMmx,
    #[error("Cyrix SMM requested on non-Cyrix model {0:?}")]
    CyrixSmmOnNonCyrix(CpuModel),
    #[error("CR4 mask {mask:#x} given for {model:?}, which has no CR4")]
    Cr4WithoutSupport { model: CpuModel, mask: u32 },
    #[error("RAM size must be non-zero")]
    ZeroRam,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub features: Features,
    pub fpu_backend: FpuBackendKind,
    pub cr4_mask: u32,
    pub cycle_policy: CyclePolicyTable,
    /// Enables the 386 prefetch-queue stall model.
    pub prefetch: bool,
    pub ram_size: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self::for_model(CpuModel::I486)
    }
}

impl CpuConfig {
    pub fn for_model(model: CpuModel) -> Self {
        Self {
            model,
            features: model.default_features(),
            fpu_backend: FpuBackendKind::default(),
            cr4_mask: model.default_cr4_mask(),
            cycle_policy: CyclePolicyTable::default(),
            prefetch: model == CpuModel::I386,
            ram_size: 16 * 1024 * 1024,
        }
    }

    /// Switches model and resets every model-derived field.
    pub fn with_model(self, model: CpuModel) -> Self {
        Self {
            fpu_backend: self.fpu_backend,
            cycle_policy: self.cycle_policy,
            ram_size: self.ram_size,
            ..Self::for_model(model)
        }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_fpu_backend(mut self, backend: FpuBackendKind) -> Self {
        self.fpu_backend = backend;
        self
    }

    pub fn with_cr4_mask(mut self, mask: u32) -> Self {
        self.cr4_mask = mask;
        self
    }

    pub fn with_cycle_policy(mut self, policy: CyclePolicyTable) -> Self {
        self.cycle_policy = policy;
        self
    }

    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        self.prefetch = enabled;
        self
    }

    pub fn with_ram_size(mut self, bytes: usize) -> Self {
        self.ram_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ram_size == 0 {
            return Err(ConfigError::ZeroRam);
        }
        if self.features.contains(Features::SSE) && !self.features.contains(Features::MMX) {
            return Err(ConfigError::SseWithoutMmx);
        }
        if self.features.contains(Features::CYRIX_SMM) && !self.model.is_cyrix() {
            return Err(ConfigError::CyrixSmmOnNonCyrix(self.model));
        }
        if self.cr4_mask != 0 && !self.model.has_cr4() {
            return Err(ConfigError::Cr4WithoutSupport {
                model: self.model,
                mask: self.cr4_mask,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn has(&self, feature: Features) -> bool {
        self.features.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_defaults_validate() {
        for model in [
            CpuModel::I386,
            CpuModel::I486,
            CpuModel::Pentium,
            CpuModel::PentiumMmx,
            CpuModel::PentiumIII,
            CpuModel::CyrixMII,
        ] {
            assert_eq!(CpuConfig::for_model(model).validate(), Ok(()), "{model:?}");
        }
    }

    #[test]
    fn contradictory_configs_are_rejected() {
        let cfg = CpuConfig::for_model(CpuModel::PentiumIII).with_features(Features::FPU | Features::SSE);
        assert_eq!(cfg.validate(), Err(ConfigError::SseWithoutMmx));

        let cfg = CpuConfig::for_model(CpuModel::Pentium)
            .with_features(Features::FPU | Features::CYRIX_SMM);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::CyrixSmmOnNonCyrix(CpuModel::Pentium))
        );

        let cfg = CpuConfig::for_model(CpuModel::I486).with_cr4_mask(0x10);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Cr4WithoutSupport { .. })
        ));

        let cfg = CpuConfig::default().with_ram_size(0);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroRam));
    }

    #[test]
    fn with_model_keeps_host_side_settings() {
        let cfg = CpuConfig::default()
            .with_fpu_backend(FpuBackendKind::Native)
            .with_ram_size(1 << 20)
            .with_model(CpuModel::I386);
        assert_eq!(cfg.fpu_backend, FpuBackendKind::Native);
        assert_eq!(cfg.ram_size, 1 << 20);
        assert!(cfg.prefetch);
        assert_eq!(cfg.cr4_mask, 0);
    }
}
