//! CRD installation utilities
//!
//! The operator installs its own CRDs on startup using server-side apply so
//! the schema in the cluster always matches the running binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use apim_common::crd::{
    ApimApi, ApimApiDeployment, ApimInboundPolicy, ApimProduct, ApimService, ApimTag,
};
use apim_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn operator_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "apimapis.apim.hedinit.io",
            crd: ApimApi::crd(),
        },
        CrdDef {
            name: "apimservices.apim.hedinit.io",
            crd: ApimService::crd(),
        },
        CrdDef {
            name: "apimapideployments.apim.hedinit.io",
            crd: ApimApiDeployment::crd(),
        },
        CrdDef {
            name: "apimproducts.apim.hedinit.io",
            crd: ApimProduct::crd(),
        },
        CrdDef {
            name: "apimtags.apim.hedinit.io",
            crd: ApimTag::crd(),
        },
        CrdDef {
            name: "apiminboundpolicies.apim.hedinit.io",
            crd: ApimInboundPolicy::crd(),
        },
    ]
}

/// Install every operator CRD using server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in operator_crds() {
        tracing::info!("Installing {} CRD...", def.name);
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("All APIM CRDs installed/updated");
    Ok(())
}

/// Every CRD as a multi-document YAML stream
pub fn all_crds_yaml() -> anyhow::Result<String> {
    let mut out = String::new();
    for def in operator_crds() {
        let doc = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize {} CRD: {}", def.name, e))?;
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}
