use crate::batches::Tier;

pub const DEFAULT_NORMAL_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_PRO_MODEL: &str = "gemini-3-pro-image-preview";
pub const DEFAULT_PRO_IMAGE_SIZE: &str = "2K";

const NORMAL_REFINE_INSTRUCTION: &str = "Keep the original image's style, composition, subject \
and colors. Apply only the changes requested above and return a single refined image.";

const PRO_REFINE_INSTRUCTION: &str = "Keep the original image's style, composition, subject, \
lighting and fine detail at full resolution. Apply only the changes requested above with high \
fidelity and return a single refined image.";

/// Model and request configuration selected by a quality tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierProfile {
    pub tier: Tier,
    pub model: String,
    /// `imageConfig.imageSize`; only the pro tier carries one.
    pub image_size: Option<String>,
    pub refine_instruction: &'static str,
}

impl TierProfile {
    pub fn default_for(tier: Tier) -> Self {
        match tier {
            Tier::Normal => Self {
                tier,
                model: DEFAULT_NORMAL_MODEL.to_string(),
                image_size: None,
                refine_instruction: NORMAL_REFINE_INSTRUCTION,
            },
            Tier::Pro => Self {
                tier,
                model: DEFAULT_PRO_MODEL.to_string(),
                image_size: Some(DEFAULT_PRO_IMAGE_SIZE.to_string()),
                refine_instruction: PRO_REFINE_INSTRUCTION,
            },
        }
    }
}

/// Profiles for both tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierProfiles {
    normal: TierProfile,
    pro: TierProfile,
}

impl Default for TierProfiles {
    fn default() -> Self {
        Self {
            normal: TierProfile::default_for(Tier::Normal),
            pro: TierProfile::default_for(Tier::Pro),
        }
    }
}

impl TierProfiles {
    pub fn get(&self, tier: Tier) -> &TierProfile {
        match tier {
            Tier::Normal => &self.normal,
            Tier::Pro => &self.pro,
        }
    }

    pub fn with_model(mut self, tier: Tier, model: impl Into<String>) -> Self {
        let model = model.into();
        if model.trim().is_empty() {
            return self;
        }
        self.profile_mut(tier).model = model.trim().to_string();
        self
    }

    /// Ignored for the normal tier, which never sends a size field.
    pub fn with_pro_image_size(mut self, size: impl Into<String>) -> Self {
        let size = size.into();
        if !size.trim().is_empty() {
            self.pro.image_size = Some(size.trim().to_ascii_uppercase());
        }
        self
    }

    fn profile_mut(&mut self, tier: Tier) -> &mut TierProfile {
        match tier {
            Tier::Normal => &mut self.normal,
            Tier::Pro => &mut self.pro,
        }
    }
}
