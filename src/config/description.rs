// Long descriptions (reST) written into the package metadata.
// `{version}` is replaced with the CUDA or ROCm version.

macro_rules! header {
    () => {
        ".. image:: https://raw.githubusercontent.com/cupy/cupy/main/docs/image/cupy_logo_1000px.png
   :width: 400

CuPy : NumPy & SciPy for GPU
============================

`CuPy <https://cupy.dev/>`_ is a NumPy/SciPy-compatible array library for GPU-accelerated computing with Python.

"
    };
}

pub const SDIST_LONG_DESCRIPTION: &str = concat!(
    header!(),
    "This package (``cupy``) is a source distribution.
For most users, use of pre-build wheel distributions are recommended:

- `cupy-cuda12x <https://pypi.org/project/cupy-cuda12x/>`_ (for CUDA 12.x)
- `cupy-cuda11x <https://pypi.org/project/cupy-cuda11x/>`_ (for CUDA 11.2 ~ 11.8)
- `cupy-rocm-6-2 <https://pypi.org/project/cupy-rocm-6-2/>`_ (for ROCm 6.2)
- `cupy-rocm-5-0 <https://pypi.org/project/cupy-rocm-5-0/>`_ (for ROCm 5.0)

Please see `Installation Guide <https://docs.cupy.dev/en/latest/install.html>`_ for the detailed instructions.
"
);

pub const WHEEL_LONG_DESCRIPTION_CUDA: &str = concat!(
    header!(),
    "This is a CuPy wheel (precompiled binary) package for CUDA {version}.
You need to install `CUDA Toolkit {version} <https://developer.nvidia.com/cuda-toolkit-archive>`_ to use these packages.

If you have another version of CUDA, or want to build from source, refer to the `Installation Guide <https://docs.cupy.dev/en/latest/install.html>`_ for instructions.
"
);

pub const WHEEL_LONG_DESCRIPTION_ROCM: &str = concat!(
    header!(),
    "This is a CuPy wheel (precompiled binary) package for AMD ROCm {version}.
You need to install `ROCm {version} <https://rocm.docs.amd.com/>`_ to use these packages.

If you have another version of ROCm, or want to build from source, refer to the `Installation Guide <https://docs.cupy.dev/en/latest/install.html>`_ for instructions.
"
);
